// 该文件是 Biaozhi （标志） 项目的一部分。
// src/output.rs - 输出定义
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

use std::path::Path;

use crate::frame::BgrFrame;

/// 将有序的标注帧写入视频容器
///
/// 帧序列为空时实现方应直接返回，不创建输出文件。
pub trait VideoSink {
  type Error;

  fn write_video(&self, frames: &[BgrFrame], path: &Path, fps: f64) -> Result<(), Self::Error>;
}

pub mod draw;

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoSink, GStreamerVideoSinkError};
