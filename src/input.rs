// 该文件是 Biaozhi （标志） 项目的一部分。
// src/input.rs - 视频输入
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

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::frame::BgrFrame;

/// 打开视频并按解码顺序逐帧产出
///
/// 返回的迭代器有限且只能遍历一次。
pub trait FrameSource {
  type Frames: Iterator<Item = BgrFrame>;

  fn open(&self, path: &Path) -> Result<Self::Frames, FrameSourceError>;
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
  #[error("视频文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("无法解码视频 {path}: {reason}")]
  UnreadableCodec { path: PathBuf, reason: String },
}

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerFrameSource, GStreamerFrames};
