use std::path::Path;

use serde::Serialize;
use vmscope::devirt::{FlattenConfig, Flattener, Optimizer, OptimizerConfig, VmState};

use crate::{
    app::GlobalOptions,
    commands::common::{codec_for, load_image, parse_address, parse_register},
    output::{instructions, print_instructions, print_output, InsnOutput},
};

/// Options for the `optimize` command.
pub struct OptimizeOptions<'a> {
    pub vsp: &'a str,
    pub vip: &'a str,
    pub truncate: bool,
    pub show_input: bool,
    pub global: &'a GlobalOptions,
}

#[derive(Debug, Serialize)]
struct OptimizeOutput {
    handler: String,
    state: String,
    original_len: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Vec<InsnOutput>>,
    optimized: Vec<InsnOutput>,
}

pub fn run(path: &Path, rva: &str, options: &OptimizeOptions) -> anyhow::Result<()> {
    let image = load_image(path, options.global)?;
    let mut codec = codec_for(image.as_ref())?;

    let handler = parse_address(rva)?;
    let state = VmState::new(parse_register(options.vsp)?, parse_register(options.vip)?);

    let sequence =
        Flattener::new(image.as_ref(), FlattenConfig::default()).flatten_at(&mut codec, handler)?;

    let optimizer = Optimizer::new(
        OptimizerConfig::default().with_truncate_dispatch_tail(options.truncate),
    );
    let optimized = optimizer.optimize(&mut codec, &state, &[], &sequence)?;
    log::debug!(
        "0x{handler:x}: {} -> {} instructions",
        sequence.len(),
        optimized.len()
    );

    let output = OptimizeOutput {
        handler: format!("0x{handler:08x}"),
        state: state.to_string(),
        original_len: sequence.len(),
        input: options.show_input.then(|| instructions(&sequence)),
        optimized: instructions(&optimized),
    };

    print_output(&output, options.global, |out| {
        println!("Handler {} ({})", out.handler, out.state);
        if let Some(input) = &out.input {
            println!("\nFlattened ({} instructions):", out.original_len);
            print_instructions(input);
        }
        println!(
            "\nOptimized ({} of {} instructions kept):",
            out.optimized.len(),
            out.original_len
        );
        print_instructions(&out.optimized);
    })
}
