//! Provider response artifacts
//!
//! Persists each raw OCR response as a JSON file next to a copy of the
//! probed image under the cache directory. Full-frame artifacts use
//! sequential names (`cache_<n>.png` / `cache_<n>_res.json`); region-scoped
//! artifacts are named by a digest of the probe path and its sorted region
//! ids. The store also offers a legacy second-chance lookup that compares
//! the probe against every cached image with zero-mean normalized
//! cross-correlation - much slower than the hash index, used only when the
//! index misses.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::provider::DetectedText;

/// Default correlation score needed for a legacy fallback hit.
pub const DEFAULT_CORRELATION_THRESHOLD: f32 = 0.95;

/// On-disk store of provider responses.
pub struct ResultStore {
    cache_dir: PathBuf,
    correlation_threshold: f32,
}

impl ResultStore {
    /// Open (creating if needed) the store under `cache_dir`.
    pub fn open(cache_dir: &Path, correlation_threshold: f32) -> Result<Self> {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create cache directory {:?}", cache_dir))?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            correlation_threshold,
        })
    }

    /// Persist a provider response and write the detection set alongside
    /// it. Full-frame artifacts keep a byte copy of the probe file;
    /// region-scoped artifacts store `probe` itself - the cropped image
    /// the provider saw - so the stored image and the stored detection
    /// coordinates live in the same pixel space. Returns the (image, json)
    /// artifact paths.
    pub fn save(
        &self,
        probe_path: &Path,
        probe: &DynamicImage,
        detections: &[DetectedText],
        regions: &[u8],
    ) -> Result<(PathBuf, PathBuf)> {
        let (image_path, json_path) = if regions.is_empty() {
            self.sequential_paths()?
        } else {
            self.region_paths(probe_path, regions)
        };

        if regions.is_empty() {
            std::fs::copy(probe_path, &image_path).with_context(|| {
                format!("Failed to copy probe into cache: {:?}", probe_path)
            })?;
        } else {
            probe
                .save(&image_path)
                .with_context(|| format!("Failed to write probe crop {:?}", image_path))?;
        }
        let json = serde_json::to_string(detections)?;
        std::fs::write(&json_path, json)
            .with_context(|| format!("Failed to write artifact {:?}", json_path))?;

        debug!("Persisted {} detections to {:?}", detections.len(), json_path);
        Ok((image_path, json_path))
    }

    /// Load a persisted detection set.
    pub fn load(&self, json_path: &Path) -> Result<Vec<DetectedText>> {
        let json = std::fs::read_to_string(json_path)
            .with_context(|| format!("Failed to read artifact {:?}", json_path))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Corrupt artifact {:?}", json_path))
    }

    /// Next free sequential artifact pair. Sibling processes may race for
    /// the same number; the loser overwrites an identical-purpose file,
    /// which the advisory cache tolerates.
    fn sequential_paths(&self) -> Result<(PathBuf, PathBuf)> {
        let mut max_n = 0u64;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = name
                .strip_prefix("cache_")
                .and_then(|s| s.strip_suffix(".png"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                max_n = max_n.max(n + 1);
            }
        }
        Ok((
            self.cache_dir.join(format!("cache_{}.png", max_n)),
            self.cache_dir.join(format!("cache_{}_res.json", max_n)),
        ))
    }

    /// Deterministic artifact pair for a region-scoped probe.
    fn region_paths(&self, probe_path: &Path, regions: &[u8]) -> (PathBuf, PathBuf) {
        let mut hasher = Sha256::new();
        hasher.update(probe_path.to_string_lossy().as_bytes());
        for &id in regions {
            hasher.update([b'|', id]);
        }
        let digest = format!("{:x}", hasher.finalize());
        let tag = &digest[..16];
        (
            self.cache_dir.join(format!("cache_r{}.png", tag)),
            self.cache_dir.join(format!("cache_r{}_res.json", tag)),
        )
    }

    /// The legacy (image, json) pair list: full-frame `cache_<n>`
    /// artifacts only. Region-scoped `cache_r*` artifacts hold crops whose
    /// detection coordinates are meaningless against a full-frame probe,
    /// so they never enter this list.
    pub fn pairs(&self) -> Vec<(PathBuf, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };
        let mut pairs = Vec::new();
        for entry in entries.flatten() {
            let image_path = entry.path();
            let Some(name) = image_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let is_full_frame = name
                .strip_prefix("cache_")
                .and_then(|s| s.strip_suffix(".png"))
                .is_some_and(|s| s.parse::<u64>().is_ok());
            if is_full_frame {
                let stem = name.strip_suffix(".png").unwrap();
                let json_path = self.cache_dir.join(format!("{}_res.json", stem));
                if json_path.exists() {
                    pairs.push((image_path, json_path));
                }
            }
        }
        pairs
    }

    /// Legacy similarity fallback: scan every full-frame cached image for
    /// a pixel correlation above the threshold and return the best
    /// artifact.
    pub fn correlation_lookup(&self, probe: &GrayImage) -> Option<PathBuf> {
        let mut best: Option<(f32, PathBuf)> = None;

        for (image_path, json_path) in self.pairs() {
            let cached = match image::open(&image_path) {
                Ok(img) => img.to_luma8(),
                Err(e) => {
                    warn!("Skipping unreadable cache image {:?}: {}", image_path, e);
                    continue;
                }
            };
            let score = pixel_correlation(probe, &cached);
            if score >= self.correlation_threshold
                && best.as_ref().map_or(true, |(s, _)| score > *s)
            {
                best = Some((score, json_path));
            }
        }

        if let Some((score, ref json_path)) = best {
            debug!(
                "Pixel-correlation fallback hit {:?} (score {:.3})",
                json_path, score
            );
        }
        best.map(|(_, json_path)| json_path)
    }
}

/// Zero-mean normalized cross-correlation between two grayscale images.
/// The second image is resized when dimensions differ.
pub fn pixel_correlation(a: &GrayImage, b: &GrayImage) -> f32 {
    let (w, h) = a.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let resized;
    let b = if b.dimensions() != (w, h) {
        resized = image::imageops::resize(b, w, h, image::imageops::FilterType::Triangle);
        &resized
    } else {
        b
    };

    let mut sum_ab = 0.0f64;
    let mut sum_a2 = 0.0f64;
    let mut sum_b2 = 0.0f64;
    let mut sum_a = 0.0f64;
    let mut sum_b = 0.0f64;
    let count = (w * h) as f64;

    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let va = pa.0[0] as f64;
        let vb = pb.0[0] as f64;
        sum_ab += va * vb;
        sum_a2 += va * va;
        sum_b2 += vb * vb;
        sum_a += va;
        sum_b += vb;
    }

    let mean_a = sum_a / count;
    let mean_b = sum_b / count;
    let numerator = sum_ab - count * mean_a * mean_b;
    let denom_a = (sum_a2 - count * mean_a * mean_a).sqrt();
    let denom_b = (sum_b2 - count * mean_b * mean_b).sqrt();
    let denominator = denom_a * denom_b;

    if denominator < 1e-10 {
        return 0.0;
    }
    (numerator / denominator).clamp(0.0, 1.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use tempfile::TempDir;

    fn detection(text: &str) -> DetectedText {
        DetectedText {
            text: text.to_string(),
            confidence: 0.9,
            quad: [(0.0, 0.0), (10.0, 0.0), (10.0, 5.0), (0.0, 5.0)],
        }
    }

    fn write_probe(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        let img = GrayImage::from_fn(20, 20, |x, y| Luma([((x * 7 + y * 13) % 256) as u8]));
        img.save(&path).unwrap();
        path
    }

    fn open_probe(path: &Path) -> DynamicImage {
        image::open(path).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe = write_probe(&dir, "probe.png");
        let img = open_probe(&probe);

        let detections = vec![detection("确定")];
        let (image_path, json_path) = store.save(&probe, &img, &detections, &[]).unwrap();
        assert!(image_path.exists());

        let loaded = store.load(&json_path).unwrap();
        assert_eq!(loaded, detections);
    }

    #[test]
    fn test_sequential_naming() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe = write_probe(&dir, "probe.png");
        let img = open_probe(&probe);

        let (first, _) = store.save(&probe, &img, &[], &[]).unwrap();
        let (second, _) = store.save(&probe, &img, &[], &[]).unwrap();
        assert_eq!(first.file_name().unwrap(), "cache_0.png");
        assert_eq!(second.file_name().unwrap(), "cache_1.png");
    }

    #[test]
    fn test_region_naming_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe = write_probe(&dir, "probe.png");
        let img = open_probe(&probe);

        let (a, _) = store.save(&probe, &img, &[], &[5]).unwrap();
        let (b, _) = store.save(&probe, &img, &[], &[5]).unwrap();
        let (c, _) = store.save(&probe, &img, &[], &[5, 6]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_region_artifact_stores_the_crop() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe = write_probe(&dir, "probe.png");
        let crop = open_probe(&probe).crop_imm(5, 5, 8, 6);

        let (image_path, _) = store.save(&probe, &crop, &[], &[5]).unwrap();

        // The stored image must match the crop's pixel space, not the
        // 20x20 full frame.
        let stored = image::open(&image_path).unwrap();
        assert_eq!((stored.width(), stored.height()), (8, 6));
    }

    #[test]
    fn test_pairs_exclude_region_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe = write_probe(&dir, "probe.png");
        let img = open_probe(&probe);

        let (full, _) = store.save(&probe, &img, &[], &[]).unwrap();
        store.save(&probe, &img.crop_imm(0, 0, 10, 10), &[], &[5]).unwrap();

        let pairs = store.pairs();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, full);
    }

    #[test]
    fn test_load_corrupt_artifact_errors() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let json_path = dir.path().join("bad.json");
        std::fs::write(&json_path, "not json").unwrap();
        assert!(store.load(&json_path).is_err());
    }

    #[test]
    fn test_correlation_identical_images() {
        let img = GrayImage::from_fn(16, 16, |x, y| Luma([((x + y * 3) % 256) as u8]));
        assert!(pixel_correlation(&img, &img) > 0.99);
    }

    #[test]
    fn test_correlation_flat_image_is_zero() {
        let flat = GrayImage::from_pixel(8, 8, Luma([128]));
        let other = GrayImage::from_fn(8, 8, |x, _| Luma([(x * 30) as u8]));
        assert_eq!(pixel_correlation(&flat, &other), 0.0);
    }

    #[test]
    fn test_correlation_lookup_finds_cached_frame() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe_path = write_probe(&dir, "probe.png");

        let detections = vec![detection("hit")];
        let img = image::open(&probe_path).unwrap();
        let (_, json_path) = store.save(&probe_path, &img, &detections, &[]).unwrap();

        let probe = image::open(&probe_path).unwrap().to_luma8();
        let found = store.correlation_lookup(&probe).expect("fallback hit");
        assert_eq!(found, json_path);
    }

    #[test]
    fn test_correlation_lookup_rejects_dissimilar() {
        let dir = TempDir::new().unwrap();
        let store = ResultStore::open(dir.path(), DEFAULT_CORRELATION_THRESHOLD).unwrap();
        let probe_path = write_probe(&dir, "probe.png");
        let img = image::open(&probe_path).unwrap();
        store.save(&probe_path, &img, &[], &[]).unwrap();

        // The inverted probe is perfectly anti-correlated with the cached one.
        let inverted =
            GrayImage::from_fn(20, 20, |x, y| Luma([255 - ((x * 7 + y * 13) % 256) as u8]));
        assert!(store.correlation_lookup(&inverted).is_none());
    }
}
