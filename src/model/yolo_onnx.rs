// 该文件是 Biaozhi （标志） 项目的一部分。
// src/model/yolo_onnx.rs - 基于 ONNX Runtime 的 YOLO 检测模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  collections::{HashMap, hash_map::Entry},
  fmt::Display,
  num::NonZeroUsize,
  path::PathBuf,
  sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
};

use image::{RgbImage, imageops::FilterType};
use ndarray::{Array4, ArrayView2, Axis};
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::{TensorRef, ValueType},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{DetectResult, Detection, Device, Model};

const YOLO_DEFAULT_INPUT_SIZE: u32 = 640;
const YOLO_DEFAULT_CONFIDENCE: f32 = 0.25;
const YOLO_DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const YOLO_BOX_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum YoloOnnxError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(PathBuf),
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("创建推理会话失败 ({device}): {reason}")]
  SessionError { device: Device, reason: String },
  #[error("当前构建不支持设备 {0}，请启用 cuda 特性")]
  UnsupportedDevice(Device),
  #[error("推理错误: {0}")]
  InferenceError(String),
  #[error("模型输出形状异常: {0:?}")]
  UnexpectedOutputShape(Vec<usize>),
  #[error("推理会话锁已损坏")]
  SessionPoisoned,
}

impl YoloOnnxError {
  fn session(device: &Device, reason: impl Display) -> Self {
    YoloOnnxError::SessionError {
      device: *device,
      reason: reason.to_string(),
    }
  }

  fn inference(reason: impl Display) -> Self {
    YoloOnnxError::InferenceError(reason.to_string())
  }
}

pub struct YoloOnnxBuilder {
  model_path: PathBuf,
  device: Device,
  sessions: NonZeroUsize,
  input_size: u32,
  confidence: f32,
  nms_threshold: f32,
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      device: Device::Cpu,
      sessions: NonZeroUsize::MIN,
      input_size: YOLO_DEFAULT_INPUT_SIZE,
      confidence: YOLO_DEFAULT_CONFIDENCE,
      nms_threshold: YOLO_DEFAULT_NMS_THRESHOLD,
    }
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  /// 每个设备上的会话数，并行推理时与工作线程数一致
  pub fn sessions(mut self, sessions: NonZeroUsize) -> Self {
    self.sessions = sessions;
    self
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.confidence = confidence;
    self
  }

  pub fn nms_threshold(mut self, nms_threshold: f32) -> Self {
    self.nms_threshold = nms_threshold;
    self
  }

  /// 读取模型并为配置的设备创建会话，模型无效时在这里就会报错
  pub fn build(self) -> Result<YoloOnnx, YoloOnnxError> {
    if !self.model_path.exists() {
      return Err(YoloOnnxError::ModelNotFound(self.model_path));
    }

    info!("加载模型文件: {}", self.model_path.display());
    let model = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model.len() as f64 / (1024.0 * 1024.0)
    );

    let pool = create_pool(&model, &self.device, self.sessions)?;
    let fixed_batch = pool.first().and_then(fixed_batch_size);
    match fixed_batch {
      Some(n) => info!("模型输入批次固定为 {}，推理时按 {} 帧分块", n, n),
      None => debug!("模型输入批次为动态维度"),
    }
    info!(
      "模型加载完成，推理设备: {}，会话数: {}",
      self.device, self.sessions
    );

    let mut pools = HashMap::new();
    pools.insert(self.device, Arc::new(pool));

    Ok(YoloOnnx {
      model,
      pools: Mutex::new(pools),
      pool_size: self.sessions,
      fixed_batch,
      input_size: self.input_size,
      confidence: self.confidence,
      nms_threshold: self.nms_threshold,
    })
  }
}

fn create_session(model: &[u8], device: &Device) -> Result<Session, YoloOnnxError> {
  let builder = Session::builder()
    .map_err(|e| YoloOnnxError::session(device, e))?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(|e| YoloOnnxError::session(device, e))?;

  let builder = match device {
    Device::Cpu => builder,
    #[cfg(feature = "cuda")]
    Device::Cuda(id) => {
      use ort::execution_providers::CUDAExecutionProvider;

      builder
        .with_execution_providers([CUDAExecutionProvider::default()
          .with_device_id(*id)
          .build()])
        .map_err(|e| YoloOnnxError::session(device, e))?
    }
    #[cfg(not(feature = "cuda"))]
    Device::Cuda(_) => return Err(YoloOnnxError::UnsupportedDevice(*device)),
  };

  builder
    .commit_from_memory(model)
    .map_err(|e| YoloOnnxError::session(device, e))
}

fn create_pool(
  model: &[u8],
  device: &Device,
  size: NonZeroUsize,
) -> Result<RoundRobin<Session>, YoloOnnxError> {
  let sessions = (0..size.get())
    .map(|_| create_session(model, device))
    .collect::<Result<Vec<_>, _>>()?;
  debug!("设备 {} 上创建了 {} 个推理会话", device, sessions.len());
  Ok(RoundRobin::new(sessions))
}

/// 输入张量第一维为正数时模型只接受该批次大小，`-1` 等符号维度表示动态批次
fn fixed_batch_from_dims(dims: &[i64]) -> Option<usize> {
  match dims.first() {
    Some(&n) if n > 0 => Some(n as usize),
    _ => None,
  }
}

fn fixed_batch_size(session: &Mutex<Session>) -> Option<usize> {
  let session = session.lock().ok()?;
  let input = session.inputs.first()?;
  match &input.input_type {
    ValueType::Tensor { shape, .. } => {
      let dims: Vec<i64> = shape.iter().copied().collect();
      fixed_batch_from_dims(&dims)
    }
    _ => None,
  }
}

/// 轮询分配的一组互斥资源
///
/// 并行调用拿到不同的槽位，只有槽位数少于并发数时才会相互等待。
pub(crate) struct RoundRobin<T> {
  items: Vec<Mutex<T>>,
  next: AtomicUsize,
}

impl<T> RoundRobin<T> {
  pub(crate) fn new(items: Vec<T>) -> Self {
    Self {
      items: items.into_iter().map(Mutex::new).collect(),
      next: AtomicUsize::new(0),
    }
  }

  pub(crate) fn first(&self) -> Option<&Mutex<T>> {
    self.items.first()
  }

  pub(crate) fn next(&self) -> Option<&Mutex<T>> {
    if self.items.is_empty() {
      return None;
    }
    let index = self.next.fetch_add(1, Ordering::Relaxed) % self.items.len();
    self.items.get(index)
  }
}

/// YOLO（v8/v11 导出格式）检测模型
///
/// 输出张量形状为 `[N, 4 + C, A]`，前四个通道是 `cx, cy, w, h`。
/// 每个设备一组会话，首次使用时创建；批次维度固定的模型按固定大小分块推理。
pub struct YoloOnnx {
  model: Vec<u8>,
  pools: Mutex<HashMap<Device, Arc<RoundRobin<Session>>>>,
  pool_size: NonZeroUsize,
  fixed_batch: Option<usize>,
  input_size: u32,
  confidence: f32,
  nms_threshold: f32,
}

impl YoloOnnx {
  /// 生成 `rows` 行的 NCHW 输入，多出的行保持全零
  fn preprocess(&self, images: &[RgbImage], rows: usize) -> Array4<f32> {
    let size = self.input_size;
    let rows = rows.max(images.len());
    let mut input = Array4::<f32>::zeros((rows, 3, size as usize, size as usize));

    for (batch_idx, image) in images.iter().enumerate() {
      let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
      for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        let [r, g, b] = pixel.0;
        input[[batch_idx, 0, y, x]] = r as f32 / 255.0;
        input[[batch_idx, 1, y, x]] = g as f32 / 255.0;
        input[[batch_idx, 2, y, x]] = b as f32 / 255.0;
      }
    }

    input
  }

  fn pool(&self, device: &Device) -> Result<Arc<RoundRobin<Session>>, YoloOnnxError> {
    let mut pools = self
      .pools
      .lock()
      .map_err(|_| YoloOnnxError::SessionPoisoned)?;
    match pools.entry(*device) {
      Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
      Entry::Vacant(entry) => {
        info!("为设备 {} 创建推理会话", device);
        let pool = Arc::new(create_pool(&self.model, device, self.pool_size)?);
        Ok(Arc::clone(entry.insert(pool)))
      }
    }
  }

  fn run_chunk(
    &self,
    pool: &RoundRobin<Session>,
    images: &[RgbImage],
    rows: usize,
  ) -> Result<Vec<DetectResult>, YoloOnnxError> {
    let input = self.preprocess(images, rows);
    debug!("模型输入形状: {:?}", input.shape());

    let output = {
      let mut session = pool
        .next()
        .ok_or_else(|| YoloOnnxError::inference("没有可用的推理会话"))?
        .lock()
        .map_err(|_| YoloOnnxError::SessionPoisoned)?;
      let tensor = TensorRef::from_array_view(&input).map_err(YoloOnnxError::inference)?;
      let outputs = session
        .run(ort::inputs![tensor])
        .map_err(YoloOnnxError::inference)?;
      outputs[0]
        .try_extract_array::<f32>()
        .map_err(YoloOnnxError::inference)?
        .into_owned()
    };

    let shape = output.shape().to_vec();
    if shape.len() != 3 || shape[0] < images.len() || shape[1] <= YOLO_BOX_CHANNELS {
      return Err(YoloOnnxError::UnexpectedOutputShape(shape));
    }
    debug!("模型输出形状: {:?}", shape);

    images
      .iter()
      .zip(output.axis_iter(Axis(0)))
      .map(|(image, per_image)| {
        let per_image = per_image
          .into_dimensionality::<ndarray::Ix2>()
          .map_err(YoloOnnxError::inference)?;
        Ok(self.postprocess(per_image, image.width(), image.height()))
      })
      .collect()
  }

  fn postprocess(&self, output: ArrayView2<f32>, orig_w: u32, orig_h: u32) -> DetectResult {
    let num_classes = output.nrows().saturating_sub(YOLO_BOX_CHANNELS);
    let scale_x = orig_w as f32 / self.input_size as f32;
    let scale_y = orig_h as f32 / self.input_size as f32;

    let mut candidates = Vec::new();
    for anchor in output.axis_iter(Axis(1)) {
      let mut class_id = 0usize;
      let mut confidence = f32::MIN;
      for c in 0..num_classes {
        let score = anchor[YOLO_BOX_CHANNELS + c];
        if score > confidence {
          confidence = score;
          class_id = c;
        }
      }

      if num_classes == 0 || confidence < self.confidence {
        continue;
      }

      let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
      let x1 = ((cx - w / 2.0) * scale_x).clamp(0.0, orig_w as f32);
      let y1 = ((cy - h / 2.0) * scale_y).clamp(0.0, orig_h as f32);
      let x2 = ((cx + w / 2.0) * scale_x).clamp(0.0, orig_w as f32);
      let y2 = ((cy + h / 2.0) * scale_y).clamp(0.0, orig_h as f32);

      if x2 <= x1 || y2 <= y1 {
        continue;
      }

      candidates.push(Detection {
        class_id: class_id as u32,
        confidence: confidence.clamp(0.0, 1.0),
        bbox: [x1, y1, x2, y2],
      });
    }

    non_max_suppression(candidates, self.nms_threshold).into()
  }
}

/// 按类别做非极大值抑制
pub(crate) fn non_max_suppression(mut detections: Vec<Detection>, threshold: f32) -> Vec<Detection> {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    let suppressed = keep
      .iter()
      .any(|kept| kept.class_id == det.class_id && kept.iou(&det) >= threshold);
    if !suppressed {
      keep.push(det);
    }
  }
  keep
}

impl Model for YoloOnnx {
  type Error = YoloOnnxError;

  fn infer(&self, images: &[RgbImage], device: &Device) -> Result<Vec<DetectResult>, Self::Error> {
    if images.is_empty() {
      return Ok(Vec::new());
    }

    let pool = self.pool(device)?;
    let chunk = self.fixed_batch.unwrap_or(images.len());
    let mut results = Vec::with_capacity(images.len());
    for chunk_images in images.chunks(chunk) {
      results.extend(self.run_chunk(&pool, chunk_images, chunk)?);
    }

    debug!(
      "检测到 {} 个物体",
      results.iter().map(DetectResult::len).sum::<usize>()
    );
    Ok(results)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array2;

  fn detection(class_id: u32, confidence: f32, bbox: [f32; 4]) -> Detection {
    Detection {
      class_id,
      confidence,
      bbox,
    }
  }

  #[test]
  fn nms_keeps_best_box_per_overlapping_cluster() {
    let kept = non_max_suppression(
      vec![
        detection(0, 0.6, [0.0, 0.0, 10.0, 10.0]),
        detection(0, 0.9, [1.0, 1.0, 11.0, 11.0]),
        detection(1, 0.5, [0.0, 0.0, 10.0, 10.0]),
      ],
      0.45,
    );
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[1].class_id, 1);
  }

  #[test]
  fn missing_model_is_reported_before_loading() {
    let err = YoloOnnxBuilder::new("/nonexistent/yolov11n.onnx")
      .build()
      .err();
    assert!(matches!(err, Some(YoloOnnxError::ModelNotFound(_))));
  }

  fn bare_model(input_size: u32) -> YoloOnnx {
    YoloOnnx {
      model: Vec::new(),
      pools: Mutex::new(HashMap::new()),
      pool_size: NonZeroUsize::MIN,
      fixed_batch: None,
      input_size,
      confidence: 0.25,
      nms_threshold: 0.45,
    }
  }

  #[test]
  fn postprocess_scales_boxes_back_to_image() {
    let model = bare_model(100);

    // 两个锚点、两个类别：第一个锚点命中类别 1，第二个低于阈值
    let mut output = Array2::<f32>::zeros((6, 2));
    output[[0, 0]] = 50.0;
    output[[1, 0]] = 50.0;
    output[[2, 0]] = 20.0;
    output[[3, 0]] = 10.0;
    output[[5, 0]] = 0.8;
    output[[4, 1]] = 0.1;

    let result = model.postprocess(output.view(), 200, 100);
    assert_eq!(result.len(), 1);
    let det = &result.items[0];
    assert_eq!(det.class_id, 1);
    assert_eq!(det.bbox, [80.0, 45.0, 120.0, 55.0]);
  }

  #[test]
  fn batch_dimension_is_fixed_only_when_positive() {
    assert_eq!(fixed_batch_from_dims(&[1, 3, 640, 640]), Some(1));
    assert_eq!(fixed_batch_from_dims(&[8, 3, 640, 640]), Some(8));
    assert_eq!(fixed_batch_from_dims(&[-1, 3, 640, 640]), None);
    assert_eq!(fixed_batch_from_dims(&[]), None);
  }

  #[test]
  fn short_chunk_is_padded_with_zero_rows() {
    let model = bare_model(4);
    let images = vec![RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 51]))];

    let input = model.preprocess(&images, 3);
    assert_eq!(input.shape(), &[3, 3, 4, 4]);
    assert!((input[[0, 0, 2, 2]] - 1.0).abs() < 1e-3);
    assert!((input[[0, 2, 2, 2]] - 0.2).abs() < 1e-3);
    assert!(input.slice(ndarray::s![1.., .., .., ..]).iter().all(|&v| v == 0.0));
  }

  #[test]
  fn round_robin_hands_concurrent_callers_different_slots() {
    let pool = RoundRobin::new(vec![0usize, 1]);

    let held = pool.next().unwrap().lock().unwrap();
    let other = pool
      .next()
      .unwrap()
      .try_lock()
      .expect("第二个调用者不应等待第一个会话");
    assert_eq!((*held, *other), (0, 1));

    // 第三次回到仍被持有的第一个槽位
    assert!(pool.next().unwrap().try_lock().is_err());
  }

  #[test]
  fn empty_round_robin_yields_nothing() {
    let pool = RoundRobin::<usize>::new(Vec::new());
    assert!(pool.next().is_none());
  }
}
