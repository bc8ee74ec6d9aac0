//! VM entry discovery.
//!
//! Virtualized functions are reached through a `jmp` into a stub of the form
//!
//! ```text
//! push imm32      ; 68 xx xx xx xx   encrypted VIP of the virtualized function
//! call rel32      ; E8 xx xx xx xx   common VM entry routine
//! ```
//!
//! The scanner decodes the code section linearly and checks the target of every direct
//! `jmp` for this signature.

use iced_x86::Mnemonic;
use log::{debug, info};

use crate::{
    devirt::config::ScanConfig,
    file::{Image, Section},
    x86::{Codec, MAX_INSTRUCTION_LENGTH},
    Result,
};

/// First byte of a VM entry stub (`push imm32`).
pub const ENTRY_PUSH_OPCODE: u8 = 0x68;
/// Byte following the `push imm32` of a VM entry stub (`call rel32`).
pub const ENTRY_CALL_OPCODE: u8 = 0xE8;
/// Offset of [`ENTRY_CALL_OPCODE`] from the start of the stub.
pub const ENTRY_CALL_OFFSET: u64 = 5;

/// A direct `jmp` whose target carries the VM entry signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryReference {
    /// RVA of the `jmp` instruction
    pub site: u64,
    /// RVA of the VM entry stub
    pub entry: u64,
}

/// Returns `true` if the bytes at `rva` match the VM entry signature.
///
/// Addresses outside every section, and signatures that would extend past the raw data of
/// the section, are not entries.
///
/// # Examples
///
/// ```rust
/// use vmscope::{devirt::is_vm_entry, file::RawImage};
///
/// // push 0x11223344; call $+5
/// let image = RawImage::from_flat(
///     vec![0x68, 0x44, 0x33, 0x22, 0x11, 0xE8, 0x00, 0x00, 0x00, 0x00],
///     0x1000,
///     64,
/// );
/// assert!(is_vm_entry(&image, 0x1000));
/// assert!(!is_vm_entry(&image, 0x1001));
/// ```
#[must_use]
pub fn is_vm_entry<I: Image + ?Sized>(image: &I, rva: u64) -> bool {
    let Ok(section) = image.section_containing(rva) else {
        return false;
    };

    section.byte_at(rva) == Some(ENTRY_PUSH_OPCODE)
        && rva
            .checked_add(ENTRY_CALL_OFFSET)
            .and_then(|call| section.byte_at(call))
            == Some(ENTRY_CALL_OPCODE)
}

/// Linear-sweep scanner for VM entries.
#[derive(Debug, Clone, Default)]
pub struct EntryScanner {
    config: ScanConfig,
}

impl EntryScanner {
    /// Creates a scanner with the given configuration.
    #[must_use]
    pub fn new(config: ScanConfig) -> Self {
        EntryScanner { config }
    }

    /// Returns the RVAs of all VM entries referenced by direct jumps, in scan order.
    ///
    /// An entry is reported once per referencing jump.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Decode`] if the sweep hits bytes that do not decode and
    /// [`ScanConfig::resync_on_invalid`] is not set.
    pub fn find_entries<I: Image + ?Sized>(
        &self,
        image: &I,
        codec: &mut dyn Codec,
    ) -> Result<Vec<u64>> {
        Ok(self
            .find_references(image, codec)?
            .into_iter()
            .map(|reference| reference.entry)
            .collect())
    }

    /// Returns every direct jump to a VM entry together with its target, in scan order.
    ///
    /// # Errors
    ///
    /// Same as [`EntryScanner::find_entries`].
    pub fn find_references<I: Image + ?Sized>(
        &self,
        image: &I,
        codec: &mut dyn Codec,
    ) -> Result<Vec<EntryReference>> {
        let mut references = Vec::new();

        for section in image.sections() {
            if !self.is_code_section(&section) {
                continue;
            }

            debug!(
                "Scanning {} [0x{:x}, 0x{:x})",
                section.name,
                section.virtual_address,
                section.virtual_end()
            );
            self.scan_section(image, &section, codec, &mut references)?;
        }

        Ok(references)
    }

    fn is_code_section(&self, section: &Section<'_>) -> bool {
        match &self.config.code_section {
            Some(name) => section.name == name,
            None => section.executable,
        }
    }

    fn scan_section<I: Image + ?Sized>(
        &self,
        image: &I,
        section: &Section<'_>,
        codec: &mut dyn Codec,
        references: &mut Vec<EntryReference>,
    ) -> Result<()> {
        let scan_len = section.extent().min(section.data.len() as u64);
        let end = section.virtual_address + scan_len;
        let mut rva = section.virtual_address;

        while rva < end {
            let window = section.window(rva, MAX_INSTRUCTION_LENGTH);
            let insn = match codec.decode_one(window, rva) {
                Ok(insn) => insn,
                Err(error) if self.config.resync_on_invalid => {
                    debug!("Skipping undecodable byte - {error}");
                    rva += 1;
                    continue;
                }
                Err(error) => return Err(error),
            };

            if insn.mnemonic() == Mnemonic::Jmp {
                if let Some(target) = insn.direct_target() {
                    if is_vm_entry(image, target) {
                        info!("Found VM entry at 0x{target:x} (jmp at 0x{rva:x})");
                        references.push(EntryReference {
                            site: rva,
                            entry: target,
                        });
                    }
                }
            }

            rva += insn.len() as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        file::RawImage,
        test::{entry_stub, jmp_rel32, CodeBuilder},
        x86::IcedCodec,
        Error,
    };

    #[test]
    fn signature_accepts_push_call() {
        let image = CodeBuilder::new(0x1000)
            .at(0x1000, &entry_stub(0x1000, 0xDEAD_BEEF, 0x1100))
            .build();

        assert!(is_vm_entry(&image, 0x1000));
    }

    #[test]
    fn signature_rejects_changed_bytes() {
        let mut stub = entry_stub(0x1000, 0xDEAD_BEEF, 0x1100);
        stub[0] = 0x6A;
        let image = CodeBuilder::new(0x1000).at(0x1000, &stub).build();
        assert!(!is_vm_entry(&image, 0x1000));

        let mut stub = entry_stub(0x1000, 0xDEAD_BEEF, 0x1100);
        stub[5] = 0xE9;
        let image = CodeBuilder::new(0x1000).at(0x1000, &stub).build();
        assert!(!is_vm_entry(&image, 0x1000));
    }

    #[test]
    fn signature_outside_image() {
        // push imm32 with the call opcode missing from the raw data
        let image = CodeBuilder::new(0x1000)
            .at(0x1000, &[0x68, 0x00, 0x00, 0x00, 0x00])
            .build();

        assert!(!is_vm_entry(&image, 0x1000));
        assert!(!is_vm_entry(&image, 0x9000));
        assert!(!is_vm_entry(&image, u64::MAX));
    }

    #[test]
    fn finds_entries_in_scan_order() {
        let image = CodeBuilder::new(0x1000)
            // 0x1000: jmp 0x1100      (entry)
            .at(0x1000, &jmp_rel32(0x1000, 0x1100))
            // 0x1005: nop
            .at(0x1005, &[0x90])
            // 0x1006: jmp 0x1200      (not an entry)
            .at(0x1006, &jmp_rel32(0x1006, 0x1200))
            // 0x100B: jmp 0x1080      (entry)
            .at(0x100B, &jmp_rel32(0x100B, 0x1080))
            // 0x1010: ret
            .at(0x1010, &[0xC3])
            .at(0x1080, &entry_stub(0x1080, 1, 0x1300))
            .at(0x1100, &entry_stub(0x1100, 2, 0x1300))
            // 0x1200: push 0; ret
            .at(0x1200, &[0x6A, 0x00, 0xC3])
            .at(0x1300, &[0xC3])
            .build();

        let mut codec = IcedCodec::new(64).unwrap();
        let scanner = EntryScanner::default();

        let entries = scanner.find_entries(&image, &mut codec).unwrap();
        assert_eq!(entries, vec![0x1100, 0x1080]);

        let references = scanner.find_references(&image, &mut codec).unwrap();
        assert_eq!(references[0].site, 0x1000);
        assert_eq!(references[1].site, 0x100B);
    }

    #[test]
    fn jump_into_other_section() {
        let image = CodeBuilder::new(0x1000)
            .at(0x1000, &jmp_rel32(0x1000, 0x8000))
            .at(0x1005, &[0xC3])
            .build();
        let image = CodeBuilder::named(".vmp0", 0x8000)
            .at(0x8000, &entry_stub(0x8000, 7, 0x8010))
            .at(0x8010, &[0xC3])
            .append_to(image);

        let mut codec = IcedCodec::new(64).unwrap();
        let entries = EntryScanner::default()
            .find_entries(&image, &mut codec)
            .unwrap();
        assert_eq!(entries, vec![0x8000]);
    }

    #[test]
    fn only_configured_section_is_scanned() {
        let image = CodeBuilder::named(".code", 0x1000)
            .at(0x1000, &jmp_rel32(0x1000, 0x1010))
            .at(0x1010, &entry_stub(0x1010, 7, 0x1020))
            .at(0x1020, &[0xC3])
            .build();
        let mut codec = IcedCodec::new(64).unwrap();

        let default = EntryScanner::default()
            .find_entries(&image, &mut codec)
            .unwrap();
        assert!(default.is_empty());

        let named = EntryScanner::new(ScanConfig::new().with_code_section(".code"))
            .find_entries(&image, &mut codec)
            .unwrap();
        assert_eq!(named, vec![0x1010]);

        let executable = EntryScanner::new(ScanConfig::new().all_executable())
            .find_entries(&image, &mut codec)
            .unwrap();
        assert_eq!(executable, vec![0x1010]);
    }

    #[test]
    fn non_executable_sections_are_skipped() {
        let image = RawImage::new(64).with_data_section(
            ".data",
            0x1000,
            [&jmp_rel32(0x1000, 0x1005)[..], &entry_stub(0x1005, 0, 0x1005)[..]].concat(),
        );
        let mut codec = IcedCodec::new(64).unwrap();

        let entries = EntryScanner::new(ScanConfig::new().all_executable())
            .find_entries(&image, &mut codec)
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn invalid_bytes_fail_or_resync() {
        let image = CodeBuilder::new(0x1000)
            // 0x1000: (bad) - push es is invalid in 64-bit mode
            .at(0x1000, &[0x06])
            .at(0x1001, &jmp_rel32(0x1001, 0x1010))
            .at(0x1010, &entry_stub(0x1010, 7, 0x1020))
            .at(0x1020, &[0xC3])
            .build();
        let mut codec = IcedCodec::new(64).unwrap();

        let strict = EntryScanner::default().find_entries(&image, &mut codec);
        assert!(matches!(strict, Err(Error::Decode { address: 0x1000, .. })));

        let entries = EntryScanner::new(ScanConfig::new().with_resync(true))
            .find_entries(&image, &mut codec)
            .unwrap();
        assert_eq!(entries, vec![0x1010]);
    }
}
