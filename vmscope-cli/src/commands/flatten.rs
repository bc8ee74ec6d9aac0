use std::path::Path;

use serde::Serialize;
use vmscope::devirt::{FlattenConfig, Flattener};

use crate::{
    app::GlobalOptions,
    commands::common::{codec_for, load_image, parse_address},
    output::{instructions, print_instructions, print_output, InsnOutput},
};

#[derive(Debug, Serialize)]
struct FlattenOutput {
    start: String,
    instructions: Vec<InsnOutput>,
}

pub fn run(
    path: &Path,
    rva: &str,
    ip: Option<&str>,
    max_steps: usize,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let image = load_image(path, opts)?;
    let mut codec = codec_for(image.as_ref())?;

    let start = parse_address(rva)?;
    let initial_ip = ip.map(parse_address).transpose()?.unwrap_or(start);

    let flattener = Flattener::new(
        image.as_ref(),
        FlattenConfig::default().with_max_steps(max_steps),
    );
    let sequence = flattener.flatten(&mut codec, start, initial_ip)?;

    let output = FlattenOutput {
        start: format!("0x{start:08x}"),
        instructions: instructions(&sequence),
    };

    print_output(&output, opts, |out| {
        println!(
            "Flattened {} ({} instructions):",
            out.start,
            out.instructions.len()
        );
        print_instructions(&out.instructions);
    })
}
