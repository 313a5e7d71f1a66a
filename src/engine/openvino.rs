//! OpenVINO face extractor
//!
//! SCRFD detection plus ArcFace embedding. Both models are compiled once at
//! startup on the configured device and live for the life of the process;
//! there is no lazy loading or idle unloading here.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use ndarray::Array4;
use openvino::{CompiledModel, Core, ElementType, Shape, Tensor};
use tracing::info;

use crate::config::InferenceConfig;
use crate::engine::extractor::{BoundingBox, ExtractorInfo, Face, FaceExtractor};
use crate::utils::math::l2_normalize;

/// SCRFD input size.
const DETECTOR_INPUT: (u32, u32) = (640, 640);
/// ArcFace input size.
const EMBEDDER_INPUT: (u32, u32) = (112, 112);
/// SCRFD feature-map strides (det_10g layout: 3 strides, keypoints, 2
/// anchors per cell).
const STRIDES: [u32; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2;
const NMS_THRESHOLD: f32 = 0.4;

const DETECTOR_MODEL_PATH: &str = "models/scrfd_10g_kps.onnx";
const EMBEDDER_MODEL_PATH: &str = "models/glint360k_r100.onnx";

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync.
/// The underlying C++ object is thread-safe; the Rust bindings only expose
/// `&mut self` methods.
#[derive(Clone)]
struct SharedModel(Arc<CompiledModel>);

unsafe impl Send for SharedModel {}
unsafe impl Sync for SharedModel {}

impl SharedModel {
    fn create_infer_request(&self) -> Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

struct Detection {
    bbox: BoundingBox,
    landmarks: Vec<(f32, f32)>,
    confidence: f32,
}

/// SCRFD + ArcFace extractor.
pub struct OpenVinoExtractor {
    detector: SharedModel,
    embedder: SharedModel,
    device: String,
    confidence_threshold: f32,
    embedding_dim: usize,
}

impl OpenVinoExtractor {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let mut core = Core::new()?;

        let candidates: &[&str] = if config.force_cpu() {
            &["CPU"]
        } else {
            &["GPU", "CPU"]
        };

        let mut selected = None;
        for &device in candidates {
            match Self::compile(&mut core, DETECTOR_MODEL_PATH, device) {
                Ok(detector) => {
                    let embedder = Self::compile(&mut core, EMBEDDER_MODEL_PATH, device)
                        .with_context(|| format!("compiling embedder on {device}"))?;
                    selected = Some((detector, embedder, device.to_string()));
                    break;
                }
                Err(e) => {
                    info!("Device {device} unavailable for detection model: {e}");
                }
            }
        }

        let (detector, embedder, device) =
            selected.context("no OpenVINO device could compile the detection model")?;
        info!("OpenVINO extractor ready on {device}");

        Ok(Self {
            detector,
            embedder,
            device,
            confidence_threshold: 0.5,
            embedding_dim: config.embedding_dim,
        })
    }

    fn compile(core: &mut Core, path: &str, device: &str) -> Result<SharedModel> {
        let model = core.read_model_from_file(path, "")?;
        let compiled = core.compile_model(&model, device.into())?;
        Ok(SharedModel(Arc::new(compiled)))
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let (orig_w, orig_h) = image.dimensions();
        let (input_w, input_h) = DETECTOR_INPUT;
        let scale = f32::min(
            input_w as f32 / orig_w as f32,
            input_h as f32 / orig_h as f32,
        );

        let input = letterbox(image, input_w, input_h, scale);
        let tensor = image_to_bgr_tensor(&input);

        let mut request = self.detector.create_infer_request()?;
        set_input(&mut request, &tensor, input_h, input_w)?;
        request.infer()?;

        let mut detections = Vec::new();
        // det_10g outputs: scores for each stride, then bbox distances,
        // then keypoints, each stride-major.
        for (idx, &stride) in STRIDES.iter().enumerate() {
            let scores = read_output(&request, idx)?;
            let bboxes = read_output(&request, idx + STRIDES.len())?;
            let kps = read_output(&request, idx + STRIDES.len() * 2)?;

            let feat_w = (input_w / stride) as usize;
            let feat_h = (input_h / stride) as usize;

            for cell in 0..feat_w * feat_h {
                let cx = ((cell % feat_w) as u32 * stride) as f32;
                let cy = ((cell / feat_w) as u32 * stride) as f32;
                for anchor in 0..NUM_ANCHORS {
                    let i = cell * NUM_ANCHORS + anchor;
                    let Some(&score) = scores.get(i) else { continue };
                    if score < self.confidence_threshold {
                        continue;
                    }
                    if (i + 1) * 4 > bboxes.len() || (i + 1) * 10 > kps.len() {
                        continue;
                    }

                    // Distances are in stride units around the anchor
                    // center; map back into original-image coordinates.
                    let s = stride as f32;
                    let to_orig = |x: f32, y: f32| (x / scale, y / scale);
                    let (x1, y1) = to_orig(cx - bboxes[i * 4] * s, cy - bboxes[i * 4 + 1] * s);
                    let (x2, y2) = to_orig(cx + bboxes[i * 4 + 2] * s, cy + bboxes[i * 4 + 3] * s);

                    let landmarks = (0..5)
                        .map(|j| {
                            to_orig(
                                cx + kps[i * 10 + j * 2] * s,
                                cy + kps[i * 10 + j * 2 + 1] * s,
                            )
                        })
                        .collect();

                    detections.push(Detection {
                        bbox: BoundingBox {
                            x1: x1.clamp(0.0, orig_w as f32),
                            y1: y1.clamp(0.0, orig_h as f32),
                            x2: x2.clamp(0.0, orig_w as f32),
                            y2: y2.clamp(0.0, orig_h as f32),
                        },
                        landmarks,
                        confidence: score,
                    });
                }
            }
        }

        Ok(nms(detections))
    }

    fn embed(&self, image: &DynamicImage, bbox: &BoundingBox) -> Result<Vec<f32>> {
        let crop = crop_face(image, bbox);
        let resized = crop.resize_exact(
            EMBEDDER_INPUT.0,
            EMBEDDER_INPUT.1,
            image::imageops::FilterType::Lanczos3,
        );
        let tensor = image_to_bgr_tensor(&resized);

        let mut request = self.embedder.create_infer_request()?;
        set_input(&mut request, &tensor, EMBEDDER_INPUT.1, EMBEDDER_INPUT.0)?;
        request.infer()?;

        let mut embedding = read_output(&request, 0)?;
        embedding.truncate(self.embedding_dim);
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl FaceExtractor for OpenVinoExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Face>> {
        let detections = self.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());
        for detection in detections {
            let embedding = self.embed(image, &detection.bbox)?;
            faces.push(Face {
                bbox: detection.bbox,
                landmarks: detection.landmarks,
                embedding,
                confidence: detection.confidence,
            });
        }
        Ok(faces)
    }

    fn info(&self) -> ExtractorInfo {
        ExtractorInfo {
            model_name: "scrfd+arcface".to_string(),
            model_loaded: true,
            using_gpu: self.device == "GPU",
            device_info: format!("OpenVINO {}", self.device),
        }
    }

    fn is_accelerated(&self) -> bool {
        self.device == "GPU"
    }
}

/// Scale into the detector input size and pad the remainder with black.
fn letterbox(image: &DynamicImage, target_w: u32, target_h: u32, scale: f32) -> DynamicImage {
    let new_w = ((image.width() as f32 * scale) as u32).max(1);
    let new_h = ((image.height() as f32 * scale) as u32).max(1);
    let resized = image
        .resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
        .to_rgb8();

    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    for (x, y, pixel) in resized.enumerate_pixels() {
        padded.put_pixel(x, y, *pixel);
    }
    DynamicImage::ImageRgb8(padded)
}

/// Crop the face region with a 20% margin on each side.
fn crop_face(image: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let w = (bbox.x2 - bbox.x1).max(1.0);
    let h = (bbox.y2 - bbox.y1).max(1.0);
    let x1 = (bbox.x1 - w * 0.2).max(0.0) as u32;
    let y1 = (bbox.y1 - h * 0.2).max(0.0) as u32;
    let x2 = ((bbox.x2 + w * 0.2) as u32).min(image.width());
    let y2 = ((bbox.y2 + h * 0.2) as u32).min(image.height());
    image.crop_imm(x1, y1, x2.saturating_sub(x1).max(1), y2.saturating_sub(y1).max(1))
}

/// NCHW tensor in BGR order with InsightFace normalization
/// ((pixel - 127.5) / 128.0).
fn image_to_bgr_tensor(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = (pixel[2] as f32 - 127.5) / 128.0;
        tensor[[0, 1, y, x]] = (pixel[1] as f32 - 127.5) / 128.0;
        tensor[[0, 2, y, x]] = (pixel[0] as f32 - 127.5) / 128.0;
    }
    tensor
}

fn set_input(
    request: &mut openvino::InferRequest,
    data: &Array4<f32>,
    height: u32,
    width: u32,
) -> Result<()> {
    let shape = Shape::new(&[1, 3, height as i64, width as i64])?;
    let mut input = Tensor::new(ElementType::F32, &shape)?;
    let source = data.as_slice().context("tensor not contiguous")?;
    unsafe {
        let dst = input.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(source.as_ptr(), dst, source.len());
    }
    request.set_input_tensor(&input)?;
    Ok(())
}

fn read_output(request: &openvino::InferRequest, index: usize) -> Result<Vec<f32>> {
    let tensor = request.get_output_tensor_by_index(index)?;
    let shape = tensor.get_shape()?;
    let len: i64 = shape.get_dimensions().iter().product();
    let data = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, len as usize).to_vec()
    };
    Ok(data)
}

/// Non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<Detection>) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for detection in detections {
        if keep.iter().all(|kept| iou(&kept.bbox, &detection.bbox) <= NMS_THRESHOLD) {
            keep.push(detection);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
