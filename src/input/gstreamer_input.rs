// 该文件是 Biaozhi （标志） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频输入模块
//!
//! 解码视频文件，输出 BGR 帧。
//!
//! ## 系统依赖
//!
//! 使用前需要安装 GStreamer 开发库与常用插件：
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-plugins-ugly gstreamer1.0-libav
//! ```
//!
//! ## 解码后端
//!
//! 先尝试 `filesrc ! decodebin`，预滚动失败时改用 `uridecodebin` 再试一次。
//!
//! ## 基本用法
//!
//! ```no_run
//! use std::path::Path;
//! use biaozhi::input::{FrameSource, GStreamerFrameSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let frames = GStreamerFrameSource::default().open(Path::new("video.mp4"))?;
//! for frame in frames {
//!     println!("帧: {}", frame.shape());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{BGR_CHANNELS, BgrFrame},
  input::{FrameSource, FrameSourceError},
};

const PREROLL_TIMEOUT_SECS: u64 = 10;
const PROGRESS_INTERVAL: usize = 100;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
enum GStreamerInputError {
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("无法获取 appsink 元素")]
  AppSinkNotFound,
  #[error("无法获取源元素")]
  SourceNotFound,
  #[error("文件路径错误: {0}")]
  PathError(#[from] std::io::Error),
  #[error("管道错误: {0}")]
  PipelineError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderBackend {
  DecodeBin,
  UriDecodeBin,
}

impl DecoderBackend {
  const ALL: [DecoderBackend; 2] = [DecoderBackend::DecodeBin, DecoderBackend::UriDecodeBin];

  fn pipeline_description(self) -> &'static str {
    match self {
      DecoderBackend::DecodeBin => {
        "filesrc name=src ! decodebin ! videoconvert ! video/x-raw,format=BGR ! appsink name=sink sync=false max-buffers=8 drop=false"
      }
      DecoderBackend::UriDecodeBin => {
        "uridecodebin name=src ! videoconvert ! video/x-raw,format=BGR ! appsink name=sink sync=false max-buffers=8 drop=false"
      }
    }
  }

  fn configure_source(self, source: &gst::Element, path: &Path) -> Result<(), GStreamerInputError> {
    match self {
      DecoderBackend::DecodeBin => {
        let location = path.to_str().ok_or_else(|| {
          GStreamerInputError::PipelineError(format!("路径不是有效的 UTF-8: {}", path.display()))
        })?;
        source.set_property("location", location);
      }
      DecoderBackend::UriDecodeBin => {
        let absolute = std::fs::canonicalize(path)?;
        let uri = gst::glib::filename_to_uri(&absolute, None)?;
        source.set_property("uri", uri.as_str());
      }
    }
    Ok(())
  }
}

/// 基于 GStreamer 的视频文件帧源
#[derive(Debug, Clone, Copy)]
pub struct GStreamerFrameSource {
  preroll_timeout: gst::ClockTime,
}

impl Default for GStreamerFrameSource {
  fn default() -> Self {
    Self {
      preroll_timeout: gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS),
    }
  }
}

impl GStreamerFrameSource {
  fn open_with(
    &self,
    backend: DecoderBackend,
    path: &Path,
  ) -> Result<GStreamerFrames, GStreamerInputError> {
    let description = backend.pipeline_description();
    info!("GStreamer 管道描述: {}", description);

    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let source = pipeline
      .by_name("src")
      .ok_or(GStreamerInputError::SourceNotFound)?;
    backend.configure_source(&source, path)?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    // 先构造迭代器，失败返回时由 Drop 停止管道
    let frames = GStreamerFrames {
      pipeline,
      appsink,
      path: path.to_path_buf(),
      frame_count: 0,
      finished: false,
    };
    frames.preroll(self.preroll_timeout)?;
    frames.pipeline.set_state(gst::State::Playing)?;

    Ok(frames)
  }
}

impl FrameSource for GStreamerFrameSource {
  type Frames = GStreamerFrames;

  fn open(&self, path: &Path) -> Result<Self::Frames, FrameSourceError> {
    if !path.is_file() {
      return Err(FrameSourceError::NotFound(path.to_path_buf()));
    }

    gst::init().map_err(|e| FrameSourceError::UnreadableCodec {
      path: path.to_path_buf(),
      reason: e.to_string(),
    })?;

    let mut reasons = Vec::new();
    for backend in DecoderBackend::ALL {
      match self.open_with(backend, path) {
        Ok(frames) => {
          info!("使用 {:?} 后端打开视频: {}", backend, path.display());
          return Ok(frames);
        }
        Err(e) => {
          warn!("{:?} 后端无法打开视频 {}: {}", backend, path.display(), e);
          reasons.push(format!("{:?}: {}", backend, e));
        }
      }
    }

    Err(FrameSourceError::UnreadableCodec {
      path: path.to_path_buf(),
      reason: reasons.join("; "),
    })
  }
}

/// 解码帧迭代器，按解码顺序产出 BGR 帧
pub struct GStreamerFrames {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  path: PathBuf,
  frame_count: usize,
  finished: bool,
}

impl GStreamerFrames {
  fn preroll(&self, timeout: gst::ClockTime) -> Result<(), GStreamerInputError> {
    self.pipeline.set_state(gst::State::Paused)?;
    let (result, _, _) = self.pipeline.state(timeout);
    match result {
      Ok(gst::StateChangeSuccess::Async) => Err(GStreamerInputError::PipelineError(
        "预滚动超时".to_string(),
      )),
      Ok(_) => Ok(()),
      Err(e) => Err(match self.bus_error() {
        Some(reason) => GStreamerInputError::PipelineError(reason),
        None => GStreamerInputError::StateChangeError(e),
      }),
    }
  }

  fn bus_error(&self) -> Option<String> {
    let msg = self
      .pipeline
      .bus()?
      .pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
      gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
      _ => None,
    }
  }

  fn finish(&mut self) {
    self.finished = true;
    if !self.appsink.is_eos() {
      match self.bus_error() {
        Some(reason) => error!("解码中断于第 {} 帧: {}", self.frame_count, reason),
        None => warn!("解码提前结束于第 {} 帧", self.frame_count),
      }
    }
    info!(
      "视频 {} 解码完成，共 {} 帧",
      self.path.display(),
      self.frame_count
    );
  }
}

impl Drop for GStreamerFrames {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl Iterator for GStreamerFrames {
  type Item = BgrFrame;

  fn next(&mut self) -> Option<Self::Item> {
    while !self.finished {
      let sample = match self.appsink.pull_sample() {
        Ok(sample) => sample,
        Err(_) => {
          self.finish();
          return None;
        }
      };

      match sample_to_frame(&sample) {
        Ok(frame) => {
          self.frame_count += 1;
          if self.frame_count % PROGRESS_INTERVAL == 0 {
            info!("已加载 {} 帧", self.frame_count);
          }
          return Some(frame);
        }
        Err(e) => {
          error!("第 {} 帧转换失败，已跳过: {}", self.frame_count, e);
        }
      }
    }
    None
  }
}

/// 拷贝 BGR 平面并去掉行尾对齐填充
fn sample_to_frame(sample: &gst::Sample) -> Result<BgrFrame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
  let info = gst_video::VideoInfo::from_caps(caps)?;

  if info.format() != gst_video::VideoFormat::Bgr {
    return Err(GStreamerInputError::PipelineError(format!(
      "不支持的像素格式: {:?}",
      info.format()
    )));
  }

  let video_frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)?;
  let (width, height) = (info.width(), info.height());
  let stride = video_frame.plane_stride()[0] as usize;
  let plane = video_frame.plane_data(0)?;
  let row_len = width as usize * BGR_CHANNELS;

  let mut data = Vec::with_capacity(row_len * height as usize);
  for y in 0..height as usize {
    let start = y * stride;
    let row = plane.get(start..start + row_len).ok_or_else(|| {
      GStreamerInputError::PipelineError(format!(
        "缓冲区过短: 第 {} 行需要 {} 字节，实际 {}",
        y,
        start + row_len,
        plane.len()
      ))
    })?;
    data.extend_from_slice(row);
  }
  debug!("帧 {}x{}，行跨度 {}", width, height, stride);

  BgrFrame::from_raw(width, height, data)
    .ok_or_else(|| GStreamerInputError::PipelineError("帧数据长度不匹配".to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_is_not_found() {
    let result = GStreamerFrameSource::default().open(Path::new("/nonexistent/video.mp4"));
    assert!(matches!(result, Err(FrameSourceError::NotFound(_))));
  }

  #[test]
  fn backends_are_tried_in_order() {
    assert_eq!(
      DecoderBackend::ALL,
      [DecoderBackend::DecodeBin, DecoderBackend::UriDecodeBin]
    );
    for backend in DecoderBackend::ALL {
      let description = backend.pipeline_description();
      assert!(description.contains("format=BGR"));
      assert!(description.contains("appsink name=sink"));
    }
  }
}
