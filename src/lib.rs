//! # textscout
//!
//! Region-aware, perceptual-hash cached screen text retrieval.
//!
//! The engine sits in front of a remote OCR provider and answers one
//! question: where on the screen is a given piece of text? Probes are
//! fingerprinted with perceptual hashes and served from a shared on-disk
//! cache when a visually similar frame was recognized before; misses go to
//! the provider and are written through. A cache-backed miss gets exactly
//! one uncached retry, and a successful full-frame retry overwrites the
//! stale entry (self-healing cache).
//!
//! The cache is advisory, never authoritative: multiple automation
//! sessions may share one cache directory, provider failures degrade to an
//! empty detection set, and "not found" is a normal result value.
//!
//! ## Modules
//! - `region` - 3×3 screen grid and region merging
//! - `hashing` - perceptual image fingerprints and Hamming distance
//! - `storage` - SQLite hash index and on-disk response artifacts
//! - `provider` - remote OCR client and detection normalization
//! - `locator` - match filtering, ordinal selection, center resolution
//! - `engine` - the cache-then-provider-then-fallback orchestrator
//! - `capture` - injected screen capture / touch capabilities
//! - `config` - engine settings (TOML)

pub mod capture;
pub mod config;
pub mod engine;
pub mod hashing;
pub mod locator;
pub mod provider;
pub mod region;
pub mod storage;

pub use capture::{ScreenCapture, TouchInput};
pub use config::{EngineConfig, load_config, save_config};
pub use engine::{SearchOptions, TextRetriever};
pub use hashing::{HashKind, ImageHashes, hash_all, hash_image, hamming_distance};
pub use locator::MatchResult;
pub use provider::{DetectedText, HttpOcrProvider, ProviderError, TextRecognizer};
pub use region::merge_regions;
pub use storage::{HashIndex, ResultStore};
