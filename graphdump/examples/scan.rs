//! Scan a dump file, print the index summary and optionally materialize
//! one group.
//!
//! ```sh
//! cargo run --example scan -- trace.bgv
//! cargo run --example scan -- trace.bgv --json
//! cargo run --example scan -- trace.bgv --load 6
//! ```

use anyhow::{Context, bail};
use graphdump::{FolderElement, scan_file};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let path = args.next().context("usage: scan <dump-file> [--json | --load <offset>]")?;
    let mode = args.next();

    let doc = scan_file(&path).with_context(|| format!("scanning {path}"))?;

    match mode.as_deref() {
        Some("--json") => {
            println!("{}", serde_json::to_string_pretty(&doc.index.summary())?);
        }
        Some("--load") => {
            let offset: u64 = args
                .next()
                .context("--load needs an offset")?
                .parse()
                .context("offset must be an integer")?;
            let group = doc
                .lazy_groups()
                .find(|g| g.entry().start() == offset)
                .with_context(|| format!("no group starts at offset {offset}"))?;
            let result = group.complete_contents().get();
            let Some(loaded) = result.loaded() else {
                bail!("load was cancelled");
            };
            println!("group '{}': {} children", group.name(), loaded.elements.len());
            for child in loaded.elements.iter() {
                match child {
                    FolderElement::Graph(graph) => println!(
                        "  graph '{}': {} nodes, {} edges",
                        graph.name,
                        graph.node_count(),
                        graph.edge_count()
                    ),
                    other => println!("  {}", other.name()),
                }
            }
        }
        Some(other) => bail!("unknown option {other}"),
        None => {
            for row in doc.index.summary() {
                let end = row
                    .end
                    .map_or("?".to_string(), |e| e.to_string());
                println!(
                    "{:>10}..{:<10} {:?} nodes={} changed={} edges={}{}",
                    row.start,
                    end,
                    row.kind,
                    row.node_count,
                    row.changed_node_count,
                    row.edge_count,
                    if row.duplicate { " (duplicate)" } else { "" }
                );
            }
        }
    }
    Ok(())
}
