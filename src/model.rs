// 该文件是 Biaozhi （标志） 项目的一部分。
// src/model.rs - 检测模型
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

use std::{borrow::Cow, fmt, str::FromStr};

use image::RgbImage;
use thiserror::Error;

/// 交通标志类别，按模型输出的类别序号排列
pub const SIGN_CLASSES: [&str; 6] = [
  "stop_sign",
  "speed_limit",
  "yield",
  "traffic_light",
  "pedestrian_crossing",
  "no_entry",
];

/// 根据类别序号取类别名称，越界时回退为 `Class <id>`
pub fn class_name(class_id: u32) -> Cow<'static, str> {
  match SIGN_CLASSES.get(class_id as usize) {
    Some(name) => Cow::Borrowed(name),
    None => Cow::Owned(format!("Class {}", class_id)),
  }
}

/// 批量检测能力
///
/// 每次调用处理一整个批次，返回与输入顺序一致的逐帧结果。
/// 实现方可以返回少于输入数量的结果，调用方需要自行处理。
pub trait Model {
  type Error;

  fn infer(&self, images: &[RgbImage], device: &Device) -> Result<Vec<DetectResult>, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: [f32; 4], // [x1, y1, x2, y2]，像素坐标
}

impl Detection {
  pub fn area(&self) -> f32 {
    (self.bbox[2] - self.bbox[0]).max(0.0) * (self.bbox[3] - self.bbox[1]).max(0.0)
  }

  pub fn iou(&self, other: &Detection) -> f32 {
    let x1 = self.bbox[0].max(other.bbox[0]);
    let y1 = self.bbox[1].max(other.bbox[1]);
    let x2 = self.bbox[2].min(other.bbox[2]);
    let y2 = self.bbox[3].min(other.bbox[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 { intersection / union } else { 0.0 }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 推理设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
  #[default]
  Cpu,
  Cuda(i32),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("无法识别的设备: {0}（可选 cpu、cuda、cuda:N 或 GPU 序号）")]
pub struct DeviceParseError(String);

impl FromStr for Device {
  type Err = DeviceParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    match lower.as_str() {
      "cpu" => Ok(Device::Cpu),
      "cuda" | "gpu" => Ok(Device::Cuda(0)),
      other => {
        let ordinal = other
          .strip_prefix("cuda:")
          .or_else(|| other.strip_prefix("gpu:"))
          .unwrap_or(other);
        ordinal
          .parse::<i32>()
          .ok()
          .filter(|id| *id >= 0)
          .map(Device::Cuda)
          .ok_or_else(|| DeviceParseError(s.to_string()))
      }
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(id) => write!(f, "cuda:{}", id),
    }
  }
}

#[cfg(feature = "model_yolo_onnx")]
mod yolo_onnx;
#[cfg(feature = "model_yolo_onnx")]
pub use self::yolo_onnx::{YoloOnnx, YoloOnnxBuilder, YoloOnnxError};
