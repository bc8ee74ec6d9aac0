use std::path::Path;

use anyhow::{bail, Context};
use iced_x86::Register;
use vmscope::{
    file::{Image, PeImage, RawImage},
    x86::{IcedCodec, RegisterId},
};

use crate::app::GlobalOptions;

/// Load `path` as a PE, or as a flat dump when `--raw-base` is given.
pub fn load_image(path: &Path, opts: &GlobalOptions) -> anyhow::Result<Box<dyn Image>> {
    match opts.raw_base.as_deref() {
        Some(base) => {
            let base = parse_address(base)?;
            let data = std::fs::read(path)
                .with_context(|| format!("failed to read dump: {}", path.display()))?;
            Ok(Box::new(RawImage::from_flat(data, base, opts.bitness)))
        }
        None => {
            let image = PeImage::from_file(path)
                .with_context(|| format!("failed to load image: {}", path.display()))?;
            Ok(Box::new(image))
        }
    }
}

/// Create a codec matching the bitness of `image`.
pub fn codec_for(image: &dyn Image) -> anyhow::Result<IcedCodec> {
    IcedCodec::new(image.bitness())
        .with_context(|| format!("no codec for {}-bit code", image.bitness()))
}

/// Parse an address given as hex (`0x1a2b`) or decimal.
pub fn parse_address(text: &str) -> anyhow::Result<u64> {
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("invalid address: {text}"))
}

/// Parse a general purpose register name into its canonical identity.
pub fn parse_register(name: &str) -> anyhow::Result<RegisterId> {
    let register = Register::values()
        .filter(|register| register.is_gpr())
        .find(|register| format!("{register:?}").eq_ignore_ascii_case(name));

    match register {
        Some(register) => Ok(RegisterId::canonicalize(register)),
        None => bail!("unknown general purpose register: {name}"),
    }
}
