//! An inverted-index B-tree storage engine: posting lists, posting trees
//! and ranked scans over a pageable block store, in the spirit of
//! PostgreSQL's GIN/RUM access methods.
//!
//! The entry tree (`entry_tree`) maps `(attr, category, key)` to either an
//! inline posting list or a pointer at a standalone posting tree
//! (`posting_tree`); both trees share one generic B-tree core (`btree`)
//! for descent, splitting and latching. A `scan` driver compiles a query
//! into one cursor per key and drives them with one of three strategies —
//! regular merge-join, pre-consistent-pruned fast scan, or a ranked full
//! scan. `vacuum` reclaims dead rows and deletes emptied posting-tree
//! pages. Everything above is agnostic to how key/value bytes are
//! interpreted; that is entirely the `opclass` plugin's job.

pub mod accum;
pub mod bitmap;
pub mod btree;
pub mod codec;
pub mod config;
pub mod entry_tree;
pub mod error;
pub mod index;
pub mod model;
pub mod opclass;
pub mod page;
pub mod posting_tree;
pub mod scan;
pub mod store;
pub mod vacuum;
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
pub use index::Index;
pub use model::{Aux, Category, EntryDownlink, EntryTuple, HeapPtr, Key, Posting, PostingRef};
pub use opclass::{ExtractedEntry, IsDead, MatchState, OpClass, OpClassCapabilities, QueryEntry};
pub use vacuum::VacuumStats;
