//! Object detector collaborator.
//!
//! The model itself runs out of process. [`HttpDetector`] posts each frame
//! as a JPEG to an inference endpoint and reads back pixel-space boxes.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use streamsight_core::detection::{PixelBox, RawDetection};
use streamsight_core::frame::Frame;

/// Thresholds the detector applies before returning boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionThresholds {
    /// Minimum confidence, `0.0..=1.0`.
    pub confidence: f32,
    /// Model-side overlap (NMS) threshold.
    pub overlap: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            overlap: 0.45,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("frame could not be encoded: {0}")]
    Encode(#[from] image::ImageError),

    #[error("detector request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("detector returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Run one inference on a blank frame so the first real frame does not
    /// pay the model load cost.
    async fn warm_up(&self) -> Result<(), DetectorError>;

    async fn detect(
        &self,
        frame: &Frame,
        thresholds: &DetectionThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError>;
}

// ---------------------------------------------------------------------------
// HTTP inference endpoint
// ---------------------------------------------------------------------------

const WARM_UP_SIZE: u32 = 640;
const JPEG_QUALITY: u8 = 85;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response body of the inference endpoint.
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    #[serde(alias = "class", alias = "label")]
    name: String,
    confidence: f32,
    #[serde(rename = "box")]
    bbox: PixelBox,
}

impl From<WireDetection> for RawDetection {
    fn from(d: WireDetection) -> Self {
        RawDetection {
            class_label: d.name,
            confidence: d.confidence,
            bbox: d.bbox,
        }
    }
}

/// Detector served over HTTP: `POST {url}?model=..&conf=..&iou=..` with an
/// `image/jpeg` body, answering `{"detections":[{"name","confidence","box"}]}`.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpDetector {
    pub fn new(url: String, model: String) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, url, model })
    }

    async fn infer(
        &self,
        jpeg: Vec<u8>,
        thresholds: &DetectionThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("model", self.model.clone()),
                ("conf", thresholds.confidence.to_string()),
                ("iou", thresholds.overlap.to_string()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(DetectorError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: DetectResponse = response.json().await?;
        Ok(parsed.detections.into_iter().map(RawDetection::from).collect())
    }
}

/// JPEG-encode a frame for upload.
pub fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DetectorError> {
    let mut buf = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut buf), JPEG_QUALITY);
    frame.image.write_with_encoder(encoder)?;
    Ok(buf)
}

#[async_trait]
impl Detector for HttpDetector {
    async fn warm_up(&self) -> Result<(), DetectorError> {
        let blank = Frame::new(image::RgbImage::new(WARM_UP_SIZE, WARM_UP_SIZE), 0.0);
        let boxes = self.detect(&blank, &DetectionThresholds::default()).await?;
        tracing::info!(model = %self.model, boxes = boxes.len(), "Detector warm-up complete");
        Ok(())
    }

    async fn detect(
        &self,
        frame: &Frame,
        thresholds: &DetectionThresholds,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let jpeg = encode_jpeg(frame)?;
        self.infer(jpeg, thresholds).await
    }
}
