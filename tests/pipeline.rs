//! End-to-end tests over a hand-built PE32+ image.

use iced_x86::{Mnemonic, Register};
use vmscope::{
    devirt::{is_vm_entry, process_parallel, TraceEventKind},
    prelude::*,
    x86::OperandKind,
};

const TEXT_RVA: u32 = 0x1000;
const TEXT_RAW: u32 = 0x200;
const TEXT_SIZE: u32 = 0x200;
const VMP_RVA: u32 = 0x2000;
const VMP_RAW: u32 = 0x400;
const VMP_SIZE: u32 = 0x400;

fn put(buffer: &mut [u8], offset: usize, bytes: &[u8]) {
    buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn section_header(name: &[u8], rva: u32, raw: u32, size: u32) -> [u8; 40] {
    let mut header = [0_u8; 40];
    put(&mut header, 0, name);
    put(&mut header, 8, &size.to_le_bytes());
    put(&mut header, 12, &rva.to_le_bytes());
    put(&mut header, 16, &size.to_le_bytes());
    put(&mut header, 20, &raw.to_le_bytes());
    // code | execute | read
    put(&mut header, 36, &0x6000_0020_u32.to_le_bytes());
    header
}

/// A minimal PE32+ with an executable `.text` and `.vmp0` section, both int3 filled.
fn build_pe() -> Vec<u8> {
    let mut pe = vec![0_u8; (VMP_RAW + VMP_SIZE) as usize];

    // DOS header
    put(&mut pe, 0, b"MZ");
    put(&mut pe, 0x3C, &0x40_u32.to_le_bytes());

    // PE signature and COFF header
    put(&mut pe, 0x40, b"PE\0\0");
    put(&mut pe, 0x44, &0x8664_u16.to_le_bytes()); // machine
    put(&mut pe, 0x46, &2_u16.to_le_bytes()); // number of sections
    put(&mut pe, 0x54, &240_u16.to_le_bytes()); // size of optional header
    put(&mut pe, 0x56, &0x22_u16.to_le_bytes()); // characteristics

    // Optional header (PE32+)
    let optional = 0x58;
    put(&mut pe, optional, &0x20B_u16.to_le_bytes());
    put(&mut pe, optional + 4, &(TEXT_SIZE + VMP_SIZE).to_le_bytes()); // size of code
    put(&mut pe, optional + 16, &TEXT_RVA.to_le_bytes()); // entry point
    put(&mut pe, optional + 20, &TEXT_RVA.to_le_bytes()); // base of code
    put(&mut pe, optional + 24, &0x1_4000_0000_u64.to_le_bytes()); // image base
    put(&mut pe, optional + 32, &0x1000_u32.to_le_bytes()); // section alignment
    put(&mut pe, optional + 36, &0x200_u32.to_le_bytes()); // file alignment
    put(&mut pe, optional + 40, &6_u16.to_le_bytes()); // major os version
    put(&mut pe, optional + 48, &6_u16.to_le_bytes()); // major subsystem version
    put(&mut pe, optional + 56, &0x3000_u32.to_le_bytes()); // size of image
    put(&mut pe, optional + 60, &0x200_u32.to_le_bytes()); // size of headers
    put(&mut pe, optional + 68, &3_u16.to_le_bytes()); // subsystem (console)
    put(&mut pe, optional + 108, &16_u32.to_le_bytes()); // number of rva and sizes

    // Section table
    let table = optional + 240;
    put(
        &mut pe,
        table,
        &section_header(b".text", TEXT_RVA, TEXT_RAW, TEXT_SIZE),
    );
    put(
        &mut pe,
        table + 40,
        &section_header(b".vmp0", VMP_RVA, VMP_RAW, VMP_SIZE),
    );

    pe[TEXT_RAW as usize..].fill(0xCC);
    pe
}

/// Writes `bytes` at `rva` of either section.
fn patch(pe: &mut [u8], rva: u32, bytes: &[u8]) {
    let offset = if rva >= VMP_RVA {
        rva - VMP_RVA + VMP_RAW
    } else {
        rva - TEXT_RVA + TEXT_RAW
    };
    put(pe, offset as usize, bytes);
}

/// `.text`: `jmp 0x2000; ret`
///
/// `.vmp0`:
/// ```text
/// 0x2000: push 0x5972                  ; VM entry stub
/// 0x2005: call 0x2040
/// 0x2040: push rax                     ; VM entry routine
/// 0x2041: push rbx
/// 0x2042: mov rbp, rsp
/// 0x2045: mov eax, 0x2100
/// 0x204A: jmp rax
/// 0x2100: mov eax, 0x11111111          ; handler 1
/// 0x2105: xor rax, 0x01020304
/// 0x210B: not rax
/// 0x210E: sub rbp, 8
/// 0x2112: mov [rbp], rax
/// 0x2116: mov rdx, rax
/// 0x2119: jmp 0x2180
/// 0x2180: mov ecx, 0x2200
/// 0x2185: jmp rcx
/// 0x2200: mov rax, [rbp]               ; handler 2
/// 0x2204: add rbp, 8
/// 0x2208: push rax
/// 0x2209: ret
/// ```
fn protected_pe() -> Vec<u8> {
    let mut pe = build_pe();
    patch(&mut pe, 0x1000, &[0xE9, 0xFB, 0x0F, 0x00, 0x00, 0xC3]);

    patch(&mut pe, 0x2000, &[0x68, 0x72, 0x59, 0x00, 0x00]);
    patch(&mut pe, 0x2005, &[0xE8, 0x36, 0x00, 0x00, 0x00]);
    patch(
        &mut pe,
        0x2040,
        &[0x50, 0x53, 0x48, 0x89, 0xE5, 0xB8, 0x00, 0x21, 0x00, 0x00, 0xFF, 0xE0],
    );
    patch(
        &mut pe,
        0x2100,
        &[
            0xB8, 0x11, 0x11, 0x11, 0x11, // mov eax, 0x11111111
            0x48, 0x35, 0x04, 0x03, 0x02, 0x01, // xor rax, 0x01020304
            0x48, 0xF7, 0xD0, // not rax
            0x48, 0x83, 0xED, 0x08, // sub rbp, 8
            0x48, 0x89, 0x45, 0x00, // mov [rbp], rax
            0x48, 0x89, 0xC2, // mov rdx, rax
            0xEB, 0x65, // jmp 0x2180
        ],
    );
    patch(&mut pe, 0x2180, &[0xB9, 0x00, 0x22, 0x00, 0x00, 0xFF, 0xE1]);
    patch(
        &mut pe,
        0x2200,
        &[0x48, 0x8B, 0x45, 0x00, 0x48, 0x83, 0xC5, 0x08, 0x50, 0xC3],
    );
    pe
}

fn protected_image() -> PeImage {
    PeImage::from_mem(protected_pe()).unwrap()
}

fn canonical(register: Register) -> RegisterId {
    RegisterId::canonicalize(register)
}

/// Reads the VIP from `push imm32`, the VSP from `mov reg, rsp` and the first handler from
/// the last `mov eax, imm32`.
struct ToyEntryParser;

impl EntryParser for ToyEntryParser {
    fn parse(&mut self, _image: &dyn Image, sequence: &InstructionSequence) -> Result<(VmState, u64)> {
        let mut vip_rva = None;
        let mut vsp = None;
        let mut first_handler = None;

        for insn in sequence {
            let operands = insn.operands();
            match insn.mnemonic() {
                Mnemonic::Push => {
                    if let Some(value) = operands[0].as_immediate() {
                        vip_rva = Some(value);
                    }
                }
                Mnemonic::Mov => match (operands[0].as_register(), operands[1].kind) {
                    (Some(destination), OperandKind::Register(Register::RSP)) => {
                        vsp = Some(canonical(destination));
                    }
                    (Some(_), OperandKind::Immediate(value)) => {
                        first_handler = Some(value);
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        match (vsp, vip_rva, first_handler) {
            (Some(vsp), Some(vip_rva), Some(first_handler)) => Ok((
                VmState::new(vsp, canonical(Register::RSI)).with_vip_rva(vip_rva),
                first_handler,
            )),
            _ => Err(Error::Parser("Entry stub not recognised".to_string())),
        }
    }
}

/// Folds a leading `mov/xor/not/neg` chain on `rax` into a constant and takes the successor
/// from `mov ecx, imm32`.
struct ToyHandlerParser;

impl HandlerParser for ToyHandlerParser {
    fn parse(
        &mut self,
        address: u64,
        _state: &mut VmState,
        sequence: &InstructionSequence,
    ) -> Result<VmHandler> {
        let rax = canonical(Register::RAX);
        let mut handler = VmHandler::new(address);

        let mut value = 0_u64;
        let mut end = 0;
        for insn in sequence {
            let operands = insn.operands();
            if operands.first().and_then(|op| op.as_register()).map(canonical) != Some(rax) {
                break;
            }
            value = match (insn.mnemonic(), operands.get(1).and_then(|op| op.as_immediate())) {
                (Mnemonic::Mov, Some(imm)) if end == 0 => imm,
                (Mnemonic::Xor, Some(imm)) if end > 0 => value ^ imm,
                (Mnemonic::Not, None) if end > 0 => !value,
                (Mnemonic::Neg, None) if end > 0 => value.wrapping_neg(),
                _ => break,
            };
            end += 1;
        }
        if end > 1 {
            handler = handler.with_constant_range(ConstantRange::new(0, end, rax, value));
        }

        for insn in sequence {
            if insn.mnemonic() == Mnemonic::Mov
                && insn.operands()[0].as_register().map(canonical) == Some(canonical(Register::RCX))
            {
                if let Some(successor) = insn.operands()[1].as_immediate() {
                    handler = handler.with_successor(successor);
                }
            }
        }

        Ok(handler)
    }
}

#[test]
fn pe_image_layout() {
    let image = protected_image();

    assert_eq!(image.bitness(), 64);
    assert_eq!(image.image_base(), 0x1_4000_0000);
    assert_eq!(image.entry_point(), 0x1000);

    let sections = image.sections();
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0].name, ".text");
    assert_eq!(sections[1].name, ".vmp0");
    assert!(sections.iter().all(|section| section.executable));

    assert_eq!(image.rva_to_offset(0x1005).unwrap(), 0x205);
    assert_eq!(image.rva_to_offset(0x2200).unwrap(), 0x600);
    assert!(matches!(
        image.section_containing(0x8000),
        Err(Error::SectionNotFound(0x8000))
    ));
}

#[test]
fn pe_from_file() {
    let path = std::env::temp_dir().join(format!("vmscope-pipeline-{}.exe", std::process::id()));
    std::fs::write(&path, protected_pe()).unwrap();

    let image = PeImage::from_file(&path).unwrap();
    assert_eq!(image.sections().len(), 2);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn scanner_finds_entry() {
    let image = protected_image();
    let mut codec = IcedCodec::new(image.bitness()).unwrap();

    let entries = EntryScanner::default()
        .find_entries(&image, &mut codec)
        .unwrap();
    assert_eq!(entries, vec![0x2000]);
    assert!(is_vm_entry(&image, 0x2000));
    assert!(!is_vm_entry(&image, 0x2040));
}

#[test]
fn flattened_entry_has_no_transfers() {
    let image = protected_image();
    let mut codec = IcedCodec::new(64).unwrap();

    let sequence = Flattener::new(&image, FlattenConfig::default())
        .flatten_at(&mut codec, 0x2000)
        .unwrap();

    let addresses: Vec<u64> = sequence.iter().map(Insn::address).collect();
    assert_eq!(addresses, vec![0x2000, 0x2040, 0x2041, 0x2042, 0x2045]);
    assert!(sequence.iter().all(|insn| !matches!(
        insn.mnemonic(),
        Mnemonic::Jmp | Mnemonic::Call | Mnemonic::Ret | Mnemonic::Nop
    )));
}

#[test]
fn devirtualize_protected_image() {
    let image = protected_image();
    let mut devirt = Devirtualizer::with_iced(&image, ToyEntryParser, ToyHandlerParser).unwrap();
    let mut log = TraceLog::new();

    let summary = devirt.process(&mut log).unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.reports.len(), 1);

    let report = &summary.reports[0];
    assert_eq!(report.entry, 0x2000);
    assert_eq!(report.first_handler, 0x2100);
    assert_eq!(report.initial_state.vsp, canonical(Register::RBP));
    assert_eq!(report.initial_state.vip_rva, 0x5972);
    assert_eq!(report.handlers.len(), 2);

    // handler 1: the constant chain becomes one load, the copy into rdx and the
    // dispatch register load disappear
    let first = &report.handlers[0];
    assert_eq!(first.address, 0x2100);
    assert_eq!(first.successor, Some(0x2200));
    assert_eq!(first.original_len, 7);
    assert_eq!(first.optimized.len(), 3);
    let load = &first.optimized[0];
    assert_eq!(load.address(), 0x210B);
    assert_eq!(
        load.operands()[1].as_immediate(),
        Some(!(0x1111_1111_u64 ^ 0x0102_0304))
    );
    assert_eq!(first.optimized[1].mnemonic(), Mnemonic::Sub);
    assert_eq!(first.optimized[2].mnemonic(), Mnemonic::Mov);

    // handler 2 is terminal and fully live
    let last = &report.handlers[1];
    assert_eq!(last.successor, None);
    assert_eq!(last.optimized.len(), 3);

    assert_eq!(log.count(TraceEventKind::EntryFound), 1);
    assert_eq!(log.count(TraceEventKind::HandlerUnrolled), 2);
    assert_eq!(log.count(TraceEventKind::EntryFailed), 0);
}

#[test]
fn optimizing_twice_changes_nothing() {
    let image = protected_image();
    let mut devirt = Devirtualizer::with_iced(&image, ToyEntryParser, ToyHandlerParser).unwrap();
    let report = devirt.process_entry(0x2000, &mut TraceLog::new()).unwrap();

    let mut codec = IcedCodec::new(64).unwrap();
    let optimizer = Optimizer::default();
    for handler in &report.handlers {
        let again = optimizer
            .optimize(&mut codec, &report.initial_state, &[], &handler.optimized)
            .unwrap();
        assert_eq!(again, handler.optimized);
    }
}

#[test]
fn parallel_processing() {
    let image = protected_image();

    let summary = process_parallel(&[0x2000, 0x2000, 0x1005], || {
        Devirtualizer::new(
            &image,
            IcedCodec::new(64).unwrap(),
            ToyEntryParser,
            ToyHandlerParser,
        )
    });

    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.handler_count(), 4);
    // 0x1005 is a bare ret, the entry parser rejects it
    assert_eq!(summary.failures.len(), 1);
    assert!(matches!(summary.failures[0].error, Error::Parser(_)));
}

#[test]
fn flat_dump() {
    // the same entry routine loaded as a raw dump
    let image = RawImage::from_flat(
        vec![0x50, 0x53, 0x48, 0x89, 0xE5, 0xB8, 0x00, 0x21, 0x00, 0x00, 0xFF, 0xE0],
        0x2040,
        64,
    );
    let mut codec = IcedCodec::new(64).unwrap();

    let sequence = Flattener::new(&image, FlattenConfig::default())
        .flatten_at(&mut codec, 0x2040)
        .unwrap();
    assert_eq!(sequence.len(), 4);
    assert_eq!(
        sequence.to_string().lines().last(),
        Some("[0003] 0x00002045 mov eax,2100h")
    );
}
