mod app;
mod commands;
mod output;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        eprintln!("\nCancelled.");
        std::process::exit(130);
    })?;

    let cli = Cli::parse();

    // Show vmscope info+ on stderr unless --json; --verbose enables debug; RUST_LOG overrides
    if !cli.global.json {
        let level = if cli.global.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        env_logger::Builder::new()
            .filter_module("vmscope", level)
            .parse_default_env()
            .target(env_logger::Target::Stderr)
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .init();
    }

    match &cli.command {
        Command::Entries {
            path,
            section,
            all_sections,
            resync,
        } => commands::entries::run(
            path,
            section.as_deref(),
            *all_sections,
            *resync,
            &cli.global,
        ),
        Command::Flatten {
            path,
            rva,
            ip,
            max_steps,
        } => commands::flatten::run(path, rva, ip.as_deref(), *max_steps, &cli.global),
        Command::Optimize {
            path,
            rva,
            vsp,
            vip,
            no_truncate,
            show_input,
        } => commands::optimize::run(
            path,
            rva,
            &commands::optimize::OptimizeOptions {
                vsp,
                vip,
                truncate: !*no_truncate,
                show_input: *show_input,
                global: &cli.global,
            },
        ),
    }
}
