//! Small inspection binary (spec.md §6 scopes a CLI surface out of the
//! library itself; this is a debugging convenience layered on the public
//! API, feature-gated behind `tool` so the library build never pulls in
//! `structopt`).

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;

use rumcore::{Category, Config, ExtractedEntry, Index, Key, MatchState, OpClass, OpClassCapabilities, QueryEntry};

#[derive(StructOpt)]
#[structopt(name = "rumtool", about = "inspect a rumcore index")]
enum Opt {
    /// Open an index (replaying its WAL) and print basic counters.
    Meta {
        #[structopt(long)]
        dir: PathBuf,
        #[structopt(long)]
        name: String,
    },
    /// Run an exact-match scan against `attr` and print every heap pointer.
    Scan {
        #[structopt(long)]
        dir: PathBuf,
        #[structopt(long)]
        name: String,
        #[structopt(long)]
        attr: u16,
        query: String,
    },
}

/// Plain byte-lexicographic, exact-match opclass used for ad-hoc
/// inspection of indexes built with the same shape (the tests throughout
/// this crate use an equivalent opclass).
struct BytesOpClass;

impl OpClass for BytesOpClass {
    fn extract_value(&self, attr: u16, value: &[u8]) -> rumcore::Result<Vec<ExtractedEntry>> {
        Ok(vec![ExtractedEntry {
            key: Key::norm(attr, Box::from(value)),
            aux: Default::default(),
        }])
    }

    fn extract_query(&self, attr: u16, query: &[u8]) -> rumcore::Result<Vec<QueryEntry>> {
        Ok(vec![QueryEntry {
            key: Key::norm(attr, Box::from(query)),
            is_partial: false,
            predicted_count: None,
        }])
    }

    fn compare(&self, _attr: u16, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        a.cmp(b)
    }

    fn consistent(&self, _attr: u16, _query_key: &[u8], _category: Category, state: &MatchState) -> rumcore::Result<bool> {
        Ok(state.matches.iter().all(|&m| m))
    }

    fn capabilities(&self, _attr: u16) -> OpClassCapabilities {
        OpClassCapabilities::default()
    }
}

fn main() {
    let opt = Opt::from_args();
    if let Err(err) = run(opt) {
        eprintln!("rumtool: {}", err);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> rumcore::Result<()> {
    match opt {
        Opt::Meta { dir, name } => {
            let cfg = Config::new(dir.to_str().expect("dir must be utf-8"), &name);
            let index = Index::open(cfg, Arc::new(BytesOpClass))?;
            println!("opened index {} (state reconstructed by WAL replay)", index.config().name);
        }
        Opt::Scan { dir, name, attr, query } => {
            let cfg = Config::new(dir.to_str().expect("dir must be utf-8"), &name);
            let index = Index::open(cfg, Arc::new(BytesOpClass))?;
            let mut scan = index.scan(attr, query.as_bytes())?;
            while let Some((ptr, lossy)) = scan.advance()? {
                if lossy {
                    println!("{} (lossy)", ptr);
                } else {
                    println!("{}", ptr);
                }
            }
        }
    }
    Ok(())
}
