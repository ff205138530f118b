//! BlazeFace face detector using ONNX Runtime via `ort`.
//!
//! Keeps only the highest-scoring face per frame. Sessions are shared
//! between detectors through a process-wide reference-counted cache, so
//! concurrent sessions load the weights once.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use crate::detection::domain::face_detector::{DetectorFactory, FaceDetector};
use crate::shared::error::VitalsError;
use crate::shared::frame::{PixelFormat, RawFrame};
use crate::shared::region::FaceBox;

use super::execution_provider::preferred_execution_providers;
use super::shared_model_cache::SharedModelCache;

/// BlazeFace model input resolution.
const INPUT_SIZE: u32 = 128;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f64 = 0.3;

/// Number of BlazeFace anchors (short-range model).
const NUM_ANCHORS: usize = 896;

/// Loaded BlazeFace weights plus decoded anchors.
pub struct BlazefaceModel {
    session: Mutex<ort::session::Session>,
    anchors: Vec<[f32; 2]>,
}

impl BlazefaceModel {
    fn load(model_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let session = ort::session::Session::builder()?
            .with_execution_providers(preferred_execution_providers())?
            .commit_from_file(model_path)?;
        Ok(Self {
            session: Mutex::new(session),
            anchors: generate_anchors(),
        })
    }
}

/// Process-wide BlazeFace model cache.
pub fn blazeface_models() -> &'static SharedModelCache<BlazefaceModel> {
    static MODELS: OnceLock<SharedModelCache<BlazefaceModel>> = OnceLock::new();
    MODELS.get_or_init(SharedModelCache::new)
}

/// Single-face BlazeFace detector holding a lease on a shared model.
pub struct OnnxBlazefaceDetector {
    model: Arc<BlazefaceModel>,
    confidence: f64,
}

impl OnnxBlazefaceDetector {
    /// Leases the BlazeFace model at `model_path`, loading it on first use.
    pub fn new(model_path: &Path, confidence: f64) -> Result<Self, VitalsError> {
        if !model_path.is_file() {
            return Err(VitalsError::DetectorInit(format!(
                "model not found: {}",
                model_path.display()
            )));
        }
        let model = blazeface_models()
            .lease(model_path, BlazefaceModel::load)
            .map_err(|e| VitalsError::DetectorInit(e.to_string()))?;
        Ok(Self { model, confidence })
    }
}

impl FaceDetector for OnnxBlazefaceDetector {
    fn detect(&mut self, frame: &RawFrame) -> Result<Option<FaceBox>, Box<dyn std::error::Error>> {
        let fw = frame.width() as f32;
        let fh = frame.height() as f32;

        // 1. Preprocess: resize to 128x128, normalize to [0,1], NCHW
        let input_tensor = preprocess(frame, INPUT_SIZE);

        // 2. Inference
        let input_value = ort::value::Tensor::from_array(input_tensor)?;
        let mut session = self
            .model
            .session
            .lock()
            .map_err(|_| "BlazeFace session lock poisoned")?;
        let outputs = session.run(ort::inputs![input_value])?;

        // - regressors: [1, 896, 16] (box deltas + keypoints)
        // - classificators: [1, 896, 1] (confidence scores)
        if outputs.len() < 2 {
            return Err(
                format!("BlazeFace model expected 2 outputs, got {}", outputs.len()).into(),
            );
        }

        let regressors = outputs[0].try_extract_array::<f32>()?;
        let scores = outputs[1].try_extract_array::<f32>()?;
        let reg_data = regressors.as_slice().ok_or("Cannot get regressor slice")?;
        let score_data = scores.as_slice().ok_or("Cannot get score slice")?;

        // 3. Decode anchor boxes + filter by confidence
        let anchors = &self.model.anchors;
        let mut candidates = Vec::new();
        for (i, &raw_score) in score_data.iter().enumerate().take(anchors.len()) {
            let score = sigmoid(raw_score);
            if score < self.confidence as f32 {
                continue;
            }

            let reg_offset = i * 16;
            if reg_offset + 4 > reg_data.len() {
                break;
            }

            let anchor = anchors[i];
            let cx = anchor[0] + reg_data[reg_offset] / INPUT_SIZE as f32;
            let cy = anchor[1] + reg_data[reg_offset + 1] / INPUT_SIZE as f32;
            let w = reg_data[reg_offset + 2] / INPUT_SIZE as f32;
            let h = reg_data[reg_offset + 3] / INPUT_SIZE as f32;

            candidates.push(FaceBox {
                frame_index: frame.index(),
                x0: ((cx - w / 2.0) * fw).max(0.0) as f64,
                y0: ((cy - h / 2.0) * fh).max(0.0) as f64,
                x1: ((cx + w / 2.0) * fw).min(fw) as f64,
                y1: ((cy + h / 2.0) * fh).min(fh) as f64,
                confidence: score as f64,
            });
        }

        // 4. NMS, keep the primary face
        Ok(nms(&mut candidates, NMS_IOU_THRESH).into_iter().next())
    }
}

/// Builds BlazeFace detectors sharing one model lease per path.
pub struct BlazefaceDetectorFactory {
    model_path: PathBuf,
    confidence: f64,
}

impl BlazefaceDetectorFactory {
    pub fn new(model_path: PathBuf, confidence: f64) -> Self {
        Self {
            model_path,
            confidence,
        }
    }
}

impl DetectorFactory for BlazefaceDetectorFactory {
    fn create(&self) -> Result<Box<dyn FaceDetector>, VitalsError> {
        Ok(Box::new(OnnxBlazefaceDetector::new(
            &self.model_path,
            self.confidence,
        )?))
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Resize frame to `size × size` and normalize to [0,1] NCHW float32 RGB.
fn preprocess(frame: &RawFrame, size: u32) -> ndarray::Array4<f32> {
    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;
    let s = size as usize;

    // Source channel feeding each of R, G, B.
    let channels: [usize; 3] = match frame.format() {
        PixelFormat::Rgb24 => [0, 1, 2],
        PixelFormat::Bgr24 => [2, 1, 0],
        PixelFormat::Gray8 => [0, 0, 0],
    };

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, s, s));

    for y in 0..s {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / s as f64) as usize).min(src_h - 1);
        for x in 0..s {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / s as f64) as usize).min(src_w - 1);
            for (c, &src_c) in channels.iter().enumerate() {
                tensor[[0, c, y, x]] = src[[src_y, src_x, src_c]] as f32 / 255.0;
            }
        }
    }

    tensor
}

// ---------------------------------------------------------------------------
// Anchor generation (BlazeFace short-range)
// ---------------------------------------------------------------------------

/// Generate BlazeFace anchors for the short-range model.
///
/// The short-range model uses two feature map sizes: 16×16 and 8×8,
/// with 2 and 6 anchors per cell respectively.
fn generate_anchors() -> Vec<[f32; 2]> {
    let strides = [(8, 2), (16, 6)]; // (stride, anchors_per_cell)
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);

    for &(stride, num) in &strides {
        let grid_size = INPUT_SIZE as usize / stride;
        for y in 0..grid_size {
            for x in 0..grid_size {
                let cx = (x as f32 + 0.5) / grid_size as f32;
                let cy = (y as f32 + 0.5) / grid_size as f32;
                for _ in 0..num {
                    anchors.push([cx, cy]);
                }
            }
        }
    }

    anchors
}

// ---------------------------------------------------------------------------
// NMS
// ---------------------------------------------------------------------------

/// Greedy NMS; survivors are returned best-first.
fn nms(dets: &mut [FaceBox], iou_thresh: f64) -> Vec<FaceBox> {
    dets.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; dets.len()];

    for i in 0..dets.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(dets[i]);
        for j in (i + 1)..dets.len() {
            if !suppressed[j] && dets[i].iou(&dets[j]) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
