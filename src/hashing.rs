//! Perceptual image hashing
//!
//! Four 64-bit fingerprint algorithms over a downscaled grayscale view of
//! an image. Visually similar frames produce fingerprints with a low
//! Hamming distance, which makes the fingerprints usable as similarity
//! cache keys (unlike a byte-level digest, which misses one-pixel changes).
//!
//! All algorithms are deterministic for unmodified input: the same image
//! always yields the same hex string.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

/// Hash algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    /// Mean-threshold hash over an 8x8 thumbnail. Fastest, least robust.
    Average,
    /// Horizontal gradient hash over a 9x8 thumbnail. Robust to uniform
    /// brightness shifts.
    Difference,
    /// Low-frequency DCT hash over a 32x32 thumbnail. Most robust to
    /// scaling and compression artifacts.
    #[default]
    Perceptual,
    /// Haar wavelet approximation hash over a 16x16 thumbnail.
    Wavelet,
}

/// All four fingerprints of one image, hex-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHashes {
    pub ahash: String,
    pub dhash: String,
    pub phash: String,
    pub whash: String,
}

impl ImageHashes {
    /// The fingerprint for a given algorithm.
    pub fn get(&self, kind: HashKind) -> &str {
        match kind {
            HashKind::Average => &self.ahash,
            HashKind::Difference => &self.dhash,
            HashKind::Perceptual => &self.phash,
            HashKind::Wavelet => &self.whash,
        }
    }
}

/// Compute a single fingerprint.
pub fn hash_image(image: &DynamicImage, kind: HashKind) -> String {
    let bits = match kind {
        HashKind::Average => average_hash(image),
        HashKind::Difference => difference_hash(image),
        HashKind::Perceptual => perceptual_hash(image),
        HashKind::Wavelet => wavelet_hash(image),
    };
    format!("{:016x}", bits)
}

/// Compute all four fingerprints. Cache entries store every variant so the
/// configured lookup algorithm can change without invalidating the store.
pub fn hash_all(image: &DynamicImage) -> ImageHashes {
    ImageHashes {
        ahash: hash_image(image, HashKind::Average),
        dhash: hash_image(image, HashKind::Difference),
        phash: hash_image(image, HashKind::Perceptual),
        whash: hash_image(image, HashKind::Wavelet),
    }
}

/// Hamming distance between two hex-encoded 64-bit fingerprints.
///
/// Returns `None` when either string is not a valid 64-bit hex value;
/// lookup treats that as "no match" rather than an error.
pub fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    let a = u64::from_str_radix(a, 16).ok()?;
    let b = u64::from_str_radix(b, 16).ok()?;
    Some((a ^ b).count_ones())
}

/// Downscale to an exact thumbnail size in grayscale. Triangle filtering
/// keeps the thumbnail stable under small input perturbations.
fn thumbnail(image: &DynamicImage, w: u32, h: u32) -> GrayImage {
    image.resize_exact(w, h, FilterType::Triangle).to_luma8()
}

fn average_hash(image: &DynamicImage) -> u64 {
    let thumb = thumbnail(image, 8, 8);
    let sum: u64 = thumb.pixels().map(|p| p.0[0] as u64).sum();
    let mean = sum / 64;

    let mut bits = 0u64;
    for (i, p) in thumb.pixels().enumerate() {
        if p.0[0] as u64 >= mean {
            bits |= 1 << i;
        }
    }
    bits
}

fn difference_hash(image: &DynamicImage) -> u64 {
    // 9 columns give 8 horizontal gradients per row.
    let thumb = thumbnail(image, 9, 8);

    let mut bits = 0u64;
    let mut i = 0;
    for y in 0..8 {
        for x in 0..8 {
            if thumb.get_pixel(x, y).0[0] > thumb.get_pixel(x + 1, y).0[0] {
                bits |= 1 << i;
            }
            i += 1;
        }
    }
    bits
}

fn perceptual_hash(image: &DynamicImage) -> u64 {
    const N: usize = 32;
    let thumb = thumbnail(image, N as u32, N as u32);

    let mut pixels = [[0.0f64; N]; N];
    for y in 0..N {
        for x in 0..N {
            pixels[y][x] = thumb.get_pixel(x as u32, y as u32).0[0] as f64;
        }
    }

    // Top-left 8x8 block of the 2D DCT holds the lowest frequencies.
    let mut coeffs = [0.0f64; 64];
    for v in 0..8 {
        for u in 0..8 {
            let mut sum = 0.0;
            for y in 0..N {
                for x in 0..N {
                    sum += pixels[y][x]
                        * ((2 * x + 1) as f64 * u as f64 * std::f64::consts::PI
                            / (2.0 * N as f64))
                            .cos()
                        * ((2 * y + 1) as f64 * v as f64 * std::f64::consts::PI
                            / (2.0 * N as f64))
                            .cos();
                }
            }
            coeffs[v * 8 + u] = sum;
        }
    }

    // Threshold the 63 AC coefficients against their own median. The DC
    // term only encodes overall brightness and stays out of both the
    // median and the bit string (its bit is always zero), so a uniform
    // brightness shift cannot move any bit.
    let mut sorted = coeffs[1..].to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = (sorted[30] + sorted[31]) / 2.0;

    let mut bits = 0u64;
    for (i, &c) in coeffs.iter().enumerate().skip(1) {
        if c > median {
            bits |= 1 << i;
        }
    }
    bits
}

fn wavelet_hash(image: &DynamicImage) -> u64 {
    const N: usize = 16;
    let thumb = thumbnail(image, N as u32, N as u32);

    let mut data = [[0.0f64; N]; N];
    for y in 0..N {
        for x in 0..N {
            data[y][x] = thumb.get_pixel(x as u32, y as u32).0[0] as f64;
        }
    }

    // One-level 2D Haar transform; the 8x8 approximation quadrant is the
    // low-frequency view of the image.
    let mut approx = [[0.0f64; N / 2]; N / 2];
    for y in 0..N / 2 {
        for x in 0..N / 2 {
            approx[y][x] = (data[2 * y][2 * x]
                + data[2 * y][2 * x + 1]
                + data[2 * y + 1][2 * x]
                + data[2 * y + 1][2 * x + 1])
                / 4.0;
        }
    }

    let flat: Vec<f64> = approx.iter().flatten().copied().collect();
    let mut sorted = flat.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = (sorted[31] + sorted[32]) / 2.0;

    let mut bits = 0u64;
    for (i, &v) in flat.iter().enumerate() {
        if v > median {
            bits |= 1 << i;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// A deterministic gradient test image.
    fn gradient_image(w: u32, h: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    /// The gradient image with a small bright patch painted over it.
    fn patched_image(w: u32, h: u32) -> DynamicImage {
        let mut img = gradient_image(w, h).to_rgba8();
        for y in 0..h / 10 {
            for x in 0..w / 10 {
                img.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        DynamicImage::ImageRgba8(img)
    }

    /// Deterministic textured fixture. A broad frequency spectrum keeps
    /// every hash bit well away from its threshold, unlike a smooth
    /// gradient whose near-zero DCT coefficients sit on the median.
    fn textured_image(w: u32, h: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            let v = (((x * 31 + y * 17) ^ (x * 7 + y * 29)) % 200 + 20) as u8;
            Rgba([v, v, v, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    /// Uniformly brightened copy. Fixture values stay below 236 so the
    /// shift never clamps.
    fn brightened(image: &DynamicImage, delta: u8) -> DynamicImage {
        let mut img = image.to_rgba8();
        for p in img.pixels_mut() {
            p.0[0] += delta;
            p.0[1] += delta;
            p.0[2] += delta;
        }
        DynamicImage::ImageRgba8(img)
    }

    #[test]
    fn test_hash_all_deterministic() {
        let img = gradient_image(120, 80);
        assert_eq!(hash_all(&img), hash_all(&img));
    }

    #[test]
    fn test_hash_is_16_hex_chars() {
        let img = gradient_image(64, 64);
        for kind in [
            HashKind::Average,
            HashKind::Difference,
            HashKind::Perceptual,
            HashKind::Wavelet,
        ] {
            let h = hash_image(&img, kind);
            assert_eq!(h.len(), 16, "{:?} hash has wrong length: {}", kind, h);
            assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hamming_symmetric() {
        let a = hash_image(&gradient_image(100, 100), HashKind::Perceptual);
        let b = hash_image(&patched_image(100, 100), HashKind::Perceptual);
        assert_eq!(hamming_distance(&a, &b), hamming_distance(&b, &a));
    }

    #[test]
    fn test_hamming_identical_is_zero() {
        let h = hash_image(&gradient_image(50, 50), HashKind::Difference);
        assert_eq!(hamming_distance(&h, &h), Some(0));
    }

    #[test]
    fn test_hamming_rejects_garbage() {
        assert_eq!(hamming_distance("not-hex", "0000000000000000"), None);
        assert_eq!(hamming_distance("", ""), None);
    }

    #[test]
    fn test_similar_images_are_close() {
        // A uniform brightness shift only moves the mean / DC term, which
        // every algorithm discounts, so all four fingerprints stay near.
        let a = textured_image(200, 150);
        let b = brightened(&a, 20);
        for kind in [
            HashKind::Average,
            HashKind::Difference,
            HashKind::Perceptual,
            HashKind::Wavelet,
        ] {
            let dist =
                hamming_distance(&hash_image(&a, kind), &hash_image(&b, kind)).unwrap();
            assert!(
                dist <= 8,
                "{:?}: slightly modified image too far: {}",
                kind,
                dist
            );
        }
    }

    #[test]
    fn test_small_patch_stays_close() {
        let a = gradient_image(200, 150);
        let b = patched_image(200, 150);
        for kind in [HashKind::Average, HashKind::Difference] {
            let dist =
                hamming_distance(&hash_image(&a, kind), &hash_image(&b, kind)).unwrap();
            assert!(dist <= 16, "{:?}: patched image too far: {}", kind, dist);
        }
    }

    #[test]
    fn test_perceptual_hash_ignores_dc_term() {
        // The DC bit is never set, and a pure brightness change leaves the
        // AC comparison bits where they were.
        for img in [
            gradient_image(100, 100),
            textured_image(128, 96),
        ] {
            let bits =
                u64::from_str_radix(&hash_image(&img, HashKind::Perceptual), 16).unwrap();
            assert_eq!(bits & 1, 0, "DC bit must stay clear");
        }

        let a = textured_image(200, 150);
        let b = brightened(&a, 20);
        let dist = hamming_distance(
            &hash_image(&a, HashKind::Perceptual),
            &hash_image(&b, HashKind::Perceptual),
        )
        .unwrap();
        assert!(dist <= 2, "brightness shift moved perceptual bits: {}", dist);
    }

    #[test]
    fn test_dissimilar_images_are_far() {
        let a = gradient_image(100, 100);
        // Inverted gradient flips most perceptual structure.
        let inv = RgbaImage::from_fn(100, 100, |x, y| {
            Rgba([255 - (x % 256) as u8, 255 - (y % 256) as u8, 0, 255])
        });
        let b = DynamicImage::ImageRgba8(inv);

        let dist = hamming_distance(
            &hash_image(&a, HashKind::Difference),
            &hash_image(&b, HashKind::Difference),
        )
        .unwrap();
        assert!(dist > 16, "inverted image unexpectedly close: {}", dist);
    }

    #[test]
    fn test_hashes_get_by_kind() {
        let hashes = hash_all(&gradient_image(40, 40));
        assert_eq!(hashes.get(HashKind::Average), hashes.ahash);
        assert_eq!(hashes.get(HashKind::Wavelet), hashes.whash);
    }
}
