//! Remote OCR provider client
//!
//! Talks to the external OCR inference service over blocking HTTP and
//! normalizes its response into [`DetectedText`] values at the boundary.
//! The raw wire shape (parallel `rec_texts` / `rec_scores` / `dt_polys`
//! arrays) never leaks past this module.

use std::io::Cursor;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default provider endpoint.
pub const DEFAULT_OCR_URL: &str = "http://localhost:8080/ocr";

/// Default network round-trip timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Failure at the provider boundary. Callers of the retrieval engine never
/// see these; the engine degrades them to an empty detection set.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("OCR request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("OCR provider returned error code {0}")]
    ErrorCode(i64),
    #[error("malformed OCR response: {0}")]
    Malformed(String),
    #[error("failed to encode probe image: {0}")]
    Encode(#[from] image::ImageError),
}

/// One recognized text line, normalized from the provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedText {
    /// Recognized text content.
    pub text: String,
    /// Recognition confidence (0.0 - 1.0).
    pub confidence: f32,
    /// Four corner points of the detection polygon, in probe-image pixels.
    pub quad: [(f32, f32); 4],
}

/// Source of text detections for a probe image.
///
/// The production implementation is [`HttpOcrProvider`]; tests inject
/// canned or failing recognizers.
pub trait TextRecognizer {
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<DetectedText>, ProviderError>;
}

/// Blocking HTTP client for the remote OCR service.
pub struct HttpOcrProvider {
    client: reqwest::blocking::Client,
    url: String,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    file: &'a str,
    #[serde(rename = "fileType")]
    file_type: u32,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(rename = "errorCode", default)]
    error_code: i64,
    result: Option<OcrResultBody>,
}

#[derive(Deserialize)]
struct OcrResultBody {
    #[serde(rename = "ocrResults", default)]
    ocr_results: Vec<OcrResultItem>,
}

#[derive(Deserialize)]
struct OcrResultItem {
    #[serde(rename = "prunedResult")]
    pruned_result: Option<PrunedResult>,
}

#[derive(Deserialize, Default)]
struct PrunedResult {
    #[serde(default)]
    rec_texts: Vec<String>,
    #[serde(default)]
    rec_scores: Vec<f32>,
    #[serde(default)]
    dt_polys: Vec<Vec<[f32; 2]>>,
}

impl HttpOcrProvider {
    /// Build a client for the given endpoint with a request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Client against the default local endpoint.
    pub fn localhost() -> Result<Self, ProviderError> {
        Self::new(DEFAULT_OCR_URL, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl TextRecognizer for HttpOcrProvider {
    fn recognize(&self, image: &DynamicImage) -> Result<Vec<DetectedText>, ProviderError> {
        let mut png = Vec::new();
        image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        let encoded = BASE64.encode(&png);

        let response: OcrResponse = self
            .client
            .post(&self.url)
            .json(&OcrRequest {
                file: &encoded,
                file_type: 1,
            })
            .send()?
            .json()?;

        if response.error_code != 0 {
            return Err(ProviderError::ErrorCode(response.error_code));
        }

        let body = response
            .result
            .ok_or_else(|| ProviderError::Malformed("missing result body".into()))?;

        Ok(normalize(body))
    }
}

/// Zip the provider's parallel arrays into typed detections, dropping
/// entries whose polygon does not have exactly four corners.
fn normalize(body: OcrResultBody) -> Vec<DetectedText> {
    let mut detections = Vec::new();

    for item in body.ocr_results {
        let pruned = item.pruned_result.unwrap_or_default();
        let count = pruned
            .rec_texts
            .len()
            .min(pruned.rec_scores.len())
            .min(pruned.dt_polys.len());

        for i in 0..count {
            let poly = &pruned.dt_polys[i];
            if poly.len() != 4 {
                debug!(
                    "Dropping detection '{}' with {}-point polygon",
                    pruned.rec_texts[i],
                    poly.len()
                );
                continue;
            }
            detections.push(DetectedText {
                text: pruned.rec_texts[i].clone(),
                confidence: pruned.rec_scores[i].clamp(0.0, 1.0),
                quad: [
                    (poly[0][0], poly[0][1]),
                    (poly[1][0], poly[1][1]),
                    (poly[2][0], poly[2][1]),
                    (poly[3][0], poly[3][1]),
                ],
            });
        }
    }

    detections
}
