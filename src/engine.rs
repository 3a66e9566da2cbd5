//! Retrieval orchestrator
//!
//! Composes the region grid, hash index, artifact store, locator and the
//! remote OCR provider into the cache-then-provider-then-fallback search
//! protocol: SEARCH_CACHED -> SEARCH_LIVE -> RETRY_LIVE_FRESH ->
//! {FOUND, NOT_FOUND}.
//!
//! Provider and cache I/O failures never surface to callers: they degrade
//! to a miss or an empty detection set, so "not found" and "provider
//! unreachable" look identical. The calling automation already polls and
//! retries on not-found, which makes that collapse safe by contract.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use tracing::{debug, error, info, warn};

use crate::capture::{ScreenCapture, TouchInput};
use crate::config::EngineConfig;
use crate::hashing::{hash_all, ImageHashes};
use crate::locator::{self, MatchResult};
use crate::provider::{HttpOcrProvider, TextRecognizer};
use crate::region::{merge_regions, normalize_region_ids};
use crate::storage::{CacheEntry, CacheHit, HashIndex, IndexProbe, ResultStore};

/// Per-search options.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Minimum detection confidence (0.0 - 1.0).
    pub confidence_threshold: f32,
    /// 1-based ordinal when the target text appears more than once.
    pub occurrence: usize,
    /// Whether this search may be served from cache.
    pub use_cache: bool,
    /// Grid cell ids (1-9) scoping the search; empty = full frame.
    pub regions: Vec<u8>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            occurrence: 1,
            use_cache: true,
            regions: Vec::new(),
        }
    }
}

/// The screen-text retrieval engine. Construct one per process and pass it
/// by reference to every call site.
pub struct TextRetriever {
    config: EngineConfig,
    index: HashIndex,
    store: ResultStore,
    provider: Box<dyn TextRecognizer>,
}

/// A probe prepared for hashing and recognition.
struct PreparedProbe {
    /// Region crop fed to the provider (from the possibly downscaled frame).
    probe: DynamicImage,
    /// Fingerprints of the (possibly downscaled) full frame.
    hashes: ImageHashes,
    /// Digest of the probe file bytes.
    content_hash: String,
    /// Probe file size in bytes.
    image_size: i64,
    /// Normalized region ids.
    regions: Vec<u8>,
    /// Probe-pixel to frame-pixel factor (1.0 when not downscaled).
    scale: f32,
    /// Region origin in original frame pixels.
    offset: (u32, u32),
}

/// Where the detections that produced a result came from.
struct SearchOutcome {
    result: MatchResult,
    cache_served: bool,
    /// The index entry that served the hit, for self-healing.
    hit: Option<CacheHit>,
}

impl TextRetriever {
    /// Build an engine from configuration, connecting to the remote OCR
    /// provider named by `config.ocr_url`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let provider = HttpOcrProvider::new(
            config.ocr_url.clone(),
            Duration::from_secs(config.ocr_timeout_secs),
        )?;
        Self::with_provider(config, Box::new(provider))
    }

    /// Build an engine with an injected recognizer. Used by tests and by
    /// callers with a non-HTTP provider.
    pub fn with_provider(config: EngineConfig, provider: Box<dyn TextRecognizer>) -> Result<Self> {
        std::fs::create_dir_all(config.temp_dir())?;
        let index = HashIndex::open(
            &config.index_path(),
            config.hash_kind,
            config.hash_threshold,
        )?;
        let store = ResultStore::open(&config.cache_dir(), config.pixel_correlation_threshold)?;
        Ok(Self {
            config,
            index,
            store,
            provider,
        })
    }

    /// Search an image file for `target` text and resolve its full-frame
    /// center. Never fails: provider and cache errors degrade to a
    /// not-found result.
    pub fn find_text(&self, image_path: &Path, target: &str, opts: &SearchOptions) -> MatchResult {
        let start = Instant::now();
        let outcome = self.search(image_path, target, opts);

        let (result, cached) = if !outcome.result.found && outcome.cache_served {
            // The cache may be stale for this frame; give the provider one
            // uncached chance before reporting not-found.
            debug!("Cache-backed search missed '{}', retrying uncached", target);
            (
                self.retry_uncached(image_path, target, opts, outcome.hit.as_ref()),
                false,
            )
        } else {
            (outcome.result, outcome.cache_served)
        };

        if result.found {
            info!(
                cached,
                elapsed_ms = start.elapsed().as_millis() as u64,
                text = %result.text,
                center_x = result.center.0,
                center_y = result.center.1,
                "Text located"
            );
        }
        result
    }

    /// Capture the screen through the injected capability and search the
    /// capture. The temp screenshot is removed on every exit path when
    /// `delete_temp_screenshots` is set.
    pub fn capture_and_find_text(
        &self,
        capture: &mut dyn ScreenCapture,
        target: &str,
        opts: &SearchOptions,
    ) -> MatchResult {
        let start = Instant::now();
        let shot = TempShot::new(self.temp_path(), self.config.delete_temp_screenshots);
        if let Err(e) = capture.capture(shot.path()) {
            error!("Screen capture failed: {:#}", e);
            return MatchResult::not_found();
        }

        let outcome = self.search(shot.path(), target, opts);
        let (result, cached) = if !outcome.result.found && outcome.cache_served {
            // Fresh capture for the retry: the screen may have moved on
            // since the frame that populated the cache.
            debug!("Cache-backed search missed '{}', retrying with fresh capture", target);
            let fresh = TempShot::new(self.temp_path(), self.config.delete_temp_screenshots);
            match capture.capture(fresh.path()) {
                Ok(()) => (
                    self.retry_uncached(fresh.path(), target, opts, outcome.hit.as_ref()),
                    false,
                ),
                Err(e) => {
                    error!("Fresh capture for retry failed: {:#}", e);
                    (outcome.result, outcome.cache_served)
                }
            }
        } else {
            (outcome.result, outcome.cache_served)
        };

        if result.found {
            info!(
                cached,
                elapsed_ms = start.elapsed().as_millis() as u64,
                text = %result.text,
                center_x = result.center.0,
                center_y = result.center.1,
                "Text located"
            );
        }
        result
    }

    /// Capture, search, and tap the resolved center through the injected
    /// touch capability. Only the tap itself can fail.
    pub fn find_and_click_text(
        &self,
        capture: &mut dyn ScreenCapture,
        touch: &mut dyn TouchInput,
        target: &str,
        opts: &SearchOptions,
    ) -> Result<MatchResult> {
        let result = self.capture_and_find_text(capture, target, opts);
        if result.found {
            touch.tap(result.center.0, result.center.1)?;
        }
        Ok(result)
    }

    /// Number of entries currently in the cache index.
    pub fn cache_len(&self) -> Result<usize> {
        self.index.len()
    }

    /// Drop every cache entry and its backing files.
    pub fn clear_cache(&self) -> Result<usize> {
        self.index.clear()
    }

    /// One pass of the cache-then-provider protocol, without the fallback
    /// retry.
    fn search(&self, image_path: &Path, target: &str, opts: &SearchOptions) -> SearchOutcome {
        let prepared = match self.prepare(image_path, &opts.regions) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to load probe {:?}: {:#}", image_path, e);
                return SearchOutcome {
                    result: MatchResult::not_found(),
                    cache_served: false,
                    hit: None,
                };
            }
        };

        let use_cache = opts.use_cache && self.config.use_cache;
        if use_cache {
            if let Some((detections, hit)) = self.lookup_cached(&prepared) {
                let result = locator::select(
                    &detections,
                    target,
                    opts.confidence_threshold,
                    opts.occurrence,
                    prepared.scale,
                    prepared.offset,
                );
                return SearchOutcome {
                    result,
                    cache_served: true,
                    hit,
                };
            }
        }

        let detections = self.recognize_live(&prepared, image_path, use_cache);
        let result = locator::select(
            &detections,
            target,
            opts.confidence_threshold,
            opts.occurrence,
            prepared.scale,
            prepared.offset,
        );
        SearchOutcome {
            result,
            cache_served: false,
            hit: None,
        }
    }

    /// Hash-index lookup followed by the legacy pixel-correlation fallback.
    fn lookup_cached(&self, prepared: &PreparedProbe) -> Option<(Vec<crate::provider::DetectedText>, Option<CacheHit>)> {
        let probe = IndexProbe {
            content_hash: prepared.content_hash.clone(),
            primary_hash: prepared.hashes.get(self.config.hash_kind).to_string(),
            regions: prepared.regions.clone(),
        };

        if let Some(hit) = self.index.lookup(&probe) {
            match self.store.load(&hit.json_path) {
                Ok(detections) => return Some((detections, Some(hit))),
                Err(e) => warn!("Cached artifact unreadable, falling through: {:#}", e),
            }
        }

        // Second chance: slow pixel-correlation scan over full-frame
        // artifacts. Region probes are crops, so the full-frame scan would
        // hand back coordinates from the wrong pixel space - skip it.
        if prepared.regions.is_empty() {
            let gray = prepared.probe.to_luma8();
            if let Some(json_path) = self.store.correlation_lookup(&gray) {
                match self.store.load(&json_path) {
                    Ok(detections) => return Some((detections, None)),
                    Err(e) => warn!("Fallback artifact unreadable: {:#}", e),
                }
            }
        }
        None
    }

    /// Call the provider and, when caching, persist and index the result.
    fn recognize_live(
        &self,
        prepared: &PreparedProbe,
        image_path: &Path,
        persist: bool,
    ) -> Vec<crate::provider::DetectedText> {
        let detections = match self.provider.recognize(&prepared.probe) {
            Ok(d) => d,
            Err(e) => {
                error!("OCR provider failed, treating as empty result: {}", e);
                return Vec::new();
            }
        };

        if persist {
            self.persist(prepared, image_path, &detections);
        }
        detections
    }

    /// Write the artifact pair and register the index entry; evict if the
    /// cache has grown past its cap. Failures are logged, never raised.
    fn persist(
        &self,
        prepared: &PreparedProbe,
        image_path: &Path,
        detections: &[crate::provider::DetectedText],
    ) {
        let (artifact_image, artifact_json) =
            match self
                .store
                .save(image_path, &prepared.probe, detections, &prepared.regions)
            {
                Ok(paths) => paths,
                Err(e) => {
                    warn!("Failed to persist OCR result: {:#}", e);
                    return;
                }
            };

        let entry = CacheEntry {
            image_path: artifact_image.to_string_lossy().into_owned(),
            json_path: artifact_json.to_string_lossy().into_owned(),
            phash: prepared.hashes.phash.clone(),
            dhash: prepared.hashes.dhash.clone(),
            ahash: prepared.hashes.ahash.clone(),
            whash: prepared.hashes.whash.clone(),
            regions: prepared.regions.clone(),
            image_size: prepared.image_size,
            image_hash: prepared.content_hash.clone(),
        };
        if let Err(e) = self.index.upsert(&entry) {
            warn!("Failed to index OCR result: {:#}", e);
            return;
        }
        if let Err(e) = self.index.evict(self.config.max_cache_size) {
            warn!("Cache eviction failed: {:#}", e);
        }
    }

    /// One uncached recognition pass. When it succeeds on the full frame
    /// and a stale cache entry served the original miss, that entry is
    /// overwritten in place so future cache-backed lookups see the
    /// corrected state.
    fn retry_uncached(
        &self,
        image_path: &Path,
        target: &str,
        opts: &SearchOptions,
        stale: Option<&CacheHit>,
    ) -> MatchResult {
        let prepared = match self.prepare(image_path, &opts.regions) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to load retry probe {:?}: {:#}", image_path, e);
                return MatchResult::not_found();
            }
        };

        let detections = match self.provider.recognize(&prepared.probe) {
            Ok(d) => d,
            Err(e) => {
                error!("OCR provider failed on retry, treating as empty result: {}", e);
                return MatchResult::not_found();
            }
        };

        let result = locator::select(
            &detections,
            target,
            opts.confidence_threshold,
            opts.occurrence,
            prepared.scale,
            prepared.offset,
        );

        if result.found && prepared.regions.is_empty() {
            if let Some(stale) = stale {
                self.heal(stale, &prepared, image_path, &detections);
            }
        }
        result
    }

    /// Overwrite a stale cache entry with the corrected frame and
    /// detections, keeping its artifact paths and index key.
    fn heal(
        &self,
        stale: &CacheHit,
        prepared: &PreparedProbe,
        image_path: &Path,
        detections: &[crate::provider::DetectedText],
    ) {
        if let Err(e) = std::fs::copy(image_path, &stale.image_path) {
            warn!("Cache heal could not replace image artifact: {}", e);
            return;
        }
        let json = match serde_json::to_string(detections) {
            Ok(json) => json,
            Err(e) => {
                warn!("Cache heal could not serialize detections: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(&stale.json_path, json) {
            warn!("Cache heal could not replace artifact: {}", e);
            return;
        }

        let entry = CacheEntry {
            image_path: stale.image_path.clone(),
            json_path: stale.json_path.to_string_lossy().into_owned(),
            phash: prepared.hashes.phash.clone(),
            dhash: prepared.hashes.dhash.clone(),
            ahash: prepared.hashes.ahash.clone(),
            whash: prepared.hashes.whash.clone(),
            regions: Vec::new(),
            image_size: prepared.image_size,
            image_hash: prepared.content_hash.clone(),
        };
        match self.index.upsert(&entry) {
            Ok(()) => info!("Healed stale cache entry {}", stale.image_path),
            Err(e) => warn!("Cache heal could not update index: {:#}", e),
        }
    }

    /// Load a probe file, downscale if configured, compute fingerprints
    /// and crop the requested region.
    fn prepare(&self, image_path: &Path, regions: &[u8]) -> Result<PreparedProbe> {
        let bytes = std::fs::read(image_path)?;
        let content_hash = {
            use sha2::{Digest, Sha256};
            format!("{:x}", Sha256::digest(&bytes))
        };
        let image_size = bytes.len() as i64;

        let frame = image::load_from_memory(&bytes)?;
        let (orig_w, orig_h) = frame.dimensions();

        let frame = if self.config.resize_image && orig_w > self.config.max_width {
            debug!(
                "Downscaling {}x{} probe to width {}",
                orig_w, orig_h, self.config.max_width
            );
            frame.resize(self.config.max_width, u32::MAX, image::imageops::FilterType::Triangle)
        } else {
            frame
        };
        let scale = orig_w as f32 / frame.width() as f32;

        let regions = normalize_region_ids(regions);
        let (ox, oy, _, _) = merge_regions(&regions, orig_w, orig_h);
        let probe = if regions.is_empty() {
            frame.clone()
        } else {
            let (x, y, w, h) = merge_regions(&regions, frame.width(), frame.height());
            frame.crop_imm(x, y, w, h)
        };

        Ok(PreparedProbe {
            hashes: hash_all(&frame),
            probe,
            content_hash,
            image_size,
            regions,
            scale,
            offset: (ox, oy),
        })
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.config.temp_dir().join(format!("capture_{}.png", nanos))
    }
}

/// Guard for an internally allocated screenshot file. Removal on drop
/// covers every exit path, including early returns on capture errors.
struct TempShot {
    path: PathBuf,
    delete: bool,
}

impl TempShot {
    fn new(path: PathBuf, delete: bool) -> Self {
        Self { path, delete }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempShot {
    fn drop(&mut self) {
        if self.delete {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
