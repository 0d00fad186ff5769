// 该文件是 Biaozhi （标志） 项目的一部分。
// src/frame.rs - BGR 帧定义
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

use std::fmt;

use image::{ImageBuffer, Rgb, imageops::FilterType};

pub const BGR_CHANNELS: usize = 3;

/// 帧形状（高 × 宽 × 通道）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameShape {
  pub height: u32,
  pub width: u32,
  pub channels: usize,
}

impl FrameShape {
  pub fn area(&self) -> usize {
    self.height as usize * self.width as usize
  }

  pub fn byte_len(&self) -> usize {
    self.area() * self.channels
  }
}

impl fmt::Display for FrameShape {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {}, {})", self.height, self.width, self.channels)
  }
}

/// 解码器输出的帧，像素按 B、G、R 交错存放
///
/// 内部借用 `image::RgbImage` 作为像素容器，但通道语义是 BGR。
/// 送入检测模型的 RGB 图像由 [`crate::batch::Batch::to_rgb_images`] 生成。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgrFrame {
  data: ImageBuffer<Rgb<u8>, Vec<u8>>,
}

impl BgrFrame {
  pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
    ImageBuffer::from_raw(width, height, data).map(|data| Self { data })
  }

  /// 以单一颜色填充的帧，`color` 为 BGR 顺序
  pub fn filled(width: u32, height: u32, color: [u8; 3]) -> Self {
    Self {
      data: ImageBuffer::from_pixel(width, height, Rgb(color)),
    }
  }

  pub fn width(&self) -> u32 {
    self.data.width()
  }

  pub fn height(&self) -> u32 {
    self.data.height()
  }

  pub fn channels(&self) -> usize {
    BGR_CHANNELS
  }

  pub fn shape(&self) -> FrameShape {
    FrameShape {
      height: self.height(),
      width: self.width(),
      channels: self.channels(),
    }
  }

  pub fn as_raw(&self) -> &[u8] {
    self.data.as_raw()
  }

  /// 读取 `(x, y)` 处的 BGR 像素
  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    self.data.get_pixel(x, y).0
  }

  pub(crate) fn buffer_mut(&mut self) -> &mut ImageBuffer<Rgb<u8>, Vec<u8>> {
    &mut self.data
  }

  /// 双线性重采样到指定尺寸，不保持宽高比
  pub fn resized(&self, width: u32, height: u32) -> Self {
    Self {
      data: image::imageops::resize(&self.data, width, height, FilterType::Triangle),
    }
  }
}
