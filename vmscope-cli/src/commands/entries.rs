use std::path::Path;

use serde::Serialize;
use vmscope::devirt::{distinct_entries, EntryScanner, ScanConfig};

use crate::{
    app::GlobalOptions,
    commands::common::{codec_for, load_image},
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
struct ReferenceOutput {
    site: String,
    entry: String,
    section: String,
}

#[derive(Debug, Serialize)]
struct EntriesOutput {
    references: Vec<ReferenceOutput>,
    distinct: usize,
}

pub fn run(
    path: &Path,
    section: Option<&str>,
    all_sections: bool,
    resync: bool,
    opts: &GlobalOptions,
) -> anyhow::Result<()> {
    let image = load_image(path, opts)?;
    let mut codec = codec_for(image.as_ref())?;

    let mut config = ScanConfig::new().with_resync(resync);
    if all_sections {
        config = config.all_executable();
    } else if let Some(name) = section {
        config = config.with_code_section(name);
    }

    let references = EntryScanner::new(config).find_references(image.as_ref(), &mut codec)?;

    let output = EntriesOutput {
        distinct: distinct_entries(&references).len(),
        references: references
            .iter()
            .map(|reference| ReferenceOutput {
                site: format!("0x{:08x}", reference.site),
                entry: format!("0x{:08x}", reference.entry),
                section: image
                    .section_containing(reference.entry)
                    .map(|section| section.name.to_string())
                    .unwrap_or_default(),
            })
            .collect(),
    };

    print_output(&output, opts, |out| {
        if out.references.is_empty() {
            println!("No VM entries found.");
            return;
        }

        println!(
            "VM entries ({} jumps, {} distinct):",
            out.references.len(),
            out.distinct
        );
        let mut tw = TabWriter::new(&[
            ("Jump", Align::Left),
            ("Entry", Align::Left),
            ("Section", Align::Left),
        ])
        .indent("  ");
        for reference in &out.references {
            tw.row(vec![
                reference.site.clone(),
                reference.entry.clone(),
                reference.section.clone(),
            ]);
        }
        tw.print();
    })
}
