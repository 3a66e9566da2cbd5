//! Persistent cache storage
//!
//! Two cooperating pieces back the retrieval cache:
//! - `index` - SQLite index of perceptual hashes over cached frames
//! - `artifacts` - on-disk provider responses and probe image copies
//!
//! Multiple automation sessions (independent OS processes) may share one
//! cache directory. Every index access is a short-lived open/operate/close
//! transaction, so concurrent writers cannot corrupt the store; logical
//! races (double eviction, stale-hit re-creation) are tolerated because
//! the cache is advisory, never authoritative.

pub mod artifacts;
pub mod index;

pub use artifacts::ResultStore;
pub use index::{CacheEntry, CacheHit, HashIndex, IndexProbe};
