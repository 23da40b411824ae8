use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use csv::{ReaderBuilder, StringRecord, Trim};
use poh_index::{FileNodeStore, IndexConfig, PostOrderTree, StoreConfig};

#[derive(Parser)]
#[command(name = "poh-cli")]
#[command(about = "Append to and query a post-order heap time index")]
struct Cli {
    /// Node store directory
    #[arg(long)]
    dir: PathBuf,

    /// Index owner id
    #[arg(long, default_value_t = 1)]
    owner: u64,

    /// JSON file holding an index config (arity, entries_per_node, max_nodes)
    #[arg(long)]
    index_config: Option<PathBuf>,

    /// JSON file holding a store config (nodes_per_block, owners_per_dir, cache_nodes)
    #[arg(long)]
    store_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append one entry
    Append {
        #[arg(long)]
        ts: i64,

        #[arg(long)]
        value: i64,

        /// Upper bound for a ranged entry (defaults to --ts)
        #[arg(long)]
        max_ts: Option<i64>,
    },
    /// Open an entry whose end is set later with `close`
    Open {
        #[arg(long)]
        ts: i64,

        #[arg(long)]
        value: i64,
    },
    /// Set the end of the open entry
    Close {
        #[arg(long)]
        ts: i64,
    },
    /// Append every row of a CSV file with `ts` and `value` columns
    /// (and optionally `max_ts`)
    Import { input: PathBuf },
    /// Value of the last entry at or before --ts
    Highest {
        #[arg(long)]
        ts: i64,
    },
    /// Entries in [--min, --max] grouped per leaf, newest first
    Range {
        #[arg(long)]
        min: i64,

        #[arg(long)]
        max: i64,

        /// Match by start time and include the last entry starting before --min
        #[arg(long)]
        min_based: bool,
    },
    /// Print node count, entry count and forest roots
    Inspect,
}

fn load_config(
    index_path: Option<&Path>,
    store_path: Option<&Path>,
) -> Result<(IndexConfig, StoreConfig)> {
    let index = match index_path {
        Some(path) => IndexConfig::from_json_file(path)
            .with_context(|| format!("load index config {}", path.display()))?,
        None => IndexConfig::default(),
    };
    let store = match store_path {
        Some(path) => StoreConfig::from_json_file(path)
            .with_context(|| format!("load store config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    Ok((index, store))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (index_config, store_config) =
        load_config(cli.index_config.as_deref(), cli.store_config.as_deref())?;
    let store = FileNodeStore::open(&cli.dir, index_config, store_config)
        .with_context(|| format!("open node store {}", cli.dir.display()))?;
    let tree = PostOrderTree::open(cli.owner, index_config, store)
        .with_context(|| format!("open index {}", cli.owner))?;

    match cli.command {
        Commands::Append { ts, value, max_ts } => {
            tree.append_range(ts, max_ts.unwrap_or(ts), value)?;
            println!("appended nodes={} entries={}", tree.node_count(), tree.entry_count());
        }
        Commands::Open { ts, value } => {
            tree.append_min(ts, value)?;
            println!("opened nodes={} entries={}", tree.node_count(), tree.entry_count());
        }
        Commands::Close { ts } => {
            tree.set_max(ts)?;
            println!("closed nodes={} entries={}", tree.node_count(), tree.entry_count());
        }
        Commands::Import { input } => {
            let rows = import_csv(&tree, &input)?;
            println!(
                "imported rows={} nodes={} entries={}",
                rows,
                tree.node_count(),
                tree.entry_count()
            );
        }
        Commands::Highest { ts } => match tree.find_highest(ts)? {
            Some(value) => println!("{value}"),
            None => println!("not found"),
        },
        Commands::Range {
            min,
            max,
            min_based,
        } => {
            let found = if min_based {
                tree.find_all_min_based(min, max)?
            } else {
                tree.find_all(min, max)?
            };
            match found {
                Some(groups) => {
                    for group in groups {
                        let line: Vec<String> = group.iter().map(i64::to_string).collect();
                        println!("{}", line.join(","));
                    }
                }
                None => println!("not found"),
            }
        }
        Commands::Inspect => {
            println!("owner={}", tree.owner_id());
            println!(
                "arity={} entries_per_node={}",
                tree.config().arity,
                tree.config().entries_per_node
            );
            println!("nodes={} entries={}", tree.node_count(), tree.entry_count());
            if let Some(ts) = tree.last_timestamp() {
                println!("last_ts={ts} open={}", tree.has_open_entry());
            }
            for root in tree.roots() {
                println!(
                    "root address={} height={} min_ts={} max_ts={}",
                    root.address, root.height, root.min_ts, root.max_ts
                );
            }
        }
    }

    Ok(())
}

fn import_csv(tree: &PostOrderTree<FileNodeStore>, input: &Path) -> Result<u64> {
    let file = File::open(input).with_context(|| format!("open {}", input.display()))?;
    let mut csv = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(BufReader::new(file));
    let headers = csv.headers()?.clone();
    let ts_idx = column(&headers, "ts")?;
    let value_idx = column(&headers, "value")?;
    let max_idx = headers.iter().position(|h| h == "max_ts");

    let mut rows = 0u64;
    let mut record = StringRecord::new();
    while csv.read_record(&mut record)? {
        let ts = parse_field(&record, ts_idx, "ts")?;
        let value = parse_field(&record, value_idx, "value")?;
        let max_ts = match max_idx {
            Some(idx) if record.get(idx).is_some_and(|v| !v.is_empty()) => {
                parse_field(&record, idx, "max_ts")?
            }
            _ => ts,
        };
        tree.append_range(ts, max_ts, value)
            .with_context(|| format!("row {}", rows + 1))?;
        rows += 1;
    }
    Ok(rows)
}

fn column(headers: &StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| anyhow!("missing `{name}` column"))
}

fn parse_field(record: &StringRecord, idx: usize, name: &str) -> Result<i64> {
    let raw = record
        .get(idx)
        .ok_or_else(|| anyhow!("missing `{name}` field"))?;
    raw.parse::<i64>()
        .with_context(|| format!("invalid `{name}` value {raw:?}"))
}
