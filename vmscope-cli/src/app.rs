use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// vmscope - locate, flatten and simplify virtualized code in PE executables
#[derive(Debug, Parser)]
#[command(name = "vmscope", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Emit output as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Treat FILE as a flat code dump mapped at this RVA instead of a PE.
    #[arg(long, global = true, value_name = "RVA")]
    pub raw_base: Option<String>,

    /// Code bitness of a flat dump: 32 or 64.
    #[arg(long, global = true, default_value_t = 64)]
    pub bitness: u32,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List jumps into VM entry stubs (`push imm32; call rel32`).
    Entries {
        /// Path to the protected executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Scan this section instead of `.text`.
        #[arg(long, value_name = "NAME", conflicts_with = "all_sections")]
        section: Option<String>,

        /// Scan every executable section.
        #[arg(long)]
        all_sections: bool,

        /// Skip undecodable bytes instead of stopping the scan.
        #[arg(long)]
        resync: bool,
    },

    /// Follow trampolines from an address and print the linear instruction stream.
    Flatten {
        /// Path to the protected executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Start address (hex like 0x1a2b or decimal).
        #[arg(value_name = "RVA")]
        rva: String,

        /// Label the first instruction with this address instead of RVA.
        #[arg(long, value_name = "ADDRESS")]
        ip: Option<String>,

        /// Maximum number of decoded instructions.
        #[arg(long, default_value_t = 100_000)]
        max_steps: usize,
    },

    /// Flatten a handler and remove its junk instructions.
    Optimize {
        /// Path to the protected executable.
        #[arg(value_name = "FILE")]
        path: PathBuf,

        /// Handler address (hex like 0x1a2b or decimal).
        #[arg(value_name = "RVA")]
        rva: String,

        /// Register holding the virtual stack pointer.
        #[arg(long, value_name = "REG", default_value = "rbp")]
        vsp: String,

        /// Register holding the virtual instruction pointer.
        #[arg(long, value_name = "REG", default_value = "rsi")]
        vip: String,

        /// Keep instructions after the first `ja`.
        #[arg(long)]
        no_truncate: bool,

        /// Also print the flattened input.
        #[arg(long)]
        show_input: bool,
    },
}
