// 该文件是 Biaozhi （标志） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频文件输出模块
//!
//! 将标注后的视频帧编码为 H.264 并写入容器文件。
//!
//! ## 支持的容器
//!
//! 按输出文件扩展名选择：
//!
//! - **MP4** (`.mp4`, `.m4v`, `.mov`) - 默认
//! - **MKV** (`.mkv`)
//! - **AVI** (`.avi`)
//!
//! 其他扩展名按 MP4 处理。
//!
//! I420 要求宽高为偶数，奇数尺寸的帧裁掉最后一行或一列后再编码。
//!
//! ## 基本用法
//!
//! ```no_run
//! use std::path::Path;
//! use biaozhi::{frame::BgrFrame, output::{GStreamerVideoSink, VideoSink}};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let frames = vec![BgrFrame::filled(640, 480, [0, 0, 0]); 30];
//! GStreamerVideoSink::default().write_video(&frames, Path::new("output.mp4"), 30.0)?;
//! # Ok(())
//! # }
//! ```

use std::{borrow::Cow, path::Path};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{frame::BgrFrame, output::VideoSink};

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoSinkError {
  /// GStreamer 库错误
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 状态改变错误
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("找不到管道元素: {0}")]
  ElementNotFound(&'static str),
  #[error("输出路径不是有效的 UTF-8: {0}")]
  InvalidPath(String),
  #[error("无效的帧率: {0}")]
  InvalidFrameRate(f64),
  /// 缓冲区创建错误
  #[error("缓冲区创建错误")]
  BufferCreationError,
  #[error("推送第 {index} 帧失败: {reason}")]
  PushError { index: usize, reason: String },
  /// 管道错误
  #[error("管道错误: {0}")]
  PipelineError(String),
}

/// 输出容器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
  Mp4,
  Matroska,
  Avi,
}

impl Container {
  fn from_path(path: &Path) -> Self {
    let extension = path
      .extension()
      .and_then(|ext| ext.to_str())
      .map(str::to_lowercase);
    match extension.as_deref() {
      Some("mp4" | "m4v" | "mov") => Container::Mp4,
      Some("mkv") => Container::Matroska,
      Some("avi") => Container::Avi,
      other => {
        warn!("未知的输出扩展名 {:?}，按 MP4 写入", other);
        Container::Mp4
      }
    }
  }

  fn pipeline_description(self) -> &'static str {
    match self {
      Container::Mp4 => {
        "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux ! filesink name=sink"
      }
      Container::Matroska => {
        "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux ! filesink name=sink"
      }
      Container::Avi => {
        "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! avimux ! filesink name=sink"
      }
    }
  }
}

/// GStreamer 视频文件输出
///
/// 每次调用 [`VideoSink::write_video`] 构建一条新的编码管道，
/// 推送全部帧后等待 EOS。失败时删除不完整的输出文件。
#[derive(Debug, Default, Clone, Copy)]
pub struct GStreamerVideoSink;

impl GStreamerVideoSink {
  fn encode(
    &self,
    pipeline: &gst::Pipeline,
    appsrc: &gst_app::AppSrc,
    frames: &[BgrFrame],
    fps: f64,
  ) -> Result<(), GStreamerVideoSinkError> {
    let Some(first) = frames.first() else {
      return Ok(());
    };
    let (width, height) = encoded_size(first.width(), first.height());
    let frame_duration = 1_000_000_000.0 / fps;

    pipeline.set_state(gst::State::Playing)?;

    for (index, frame) in frames.iter().enumerate() {
      let frame = fit_frame(index, frame, width, height);

      let buffer = make_buffer(
        frame.as_raw(),
        (index as f64 * frame_duration) as u64,
        frame_duration as u64,
      )?;

      if let Err(e) = appsrc.push_buffer(buffer) {
        let reason = pending_bus_error(pipeline).unwrap_or_else(|| format!("{:?}", e));
        return Err(GStreamerVideoSinkError::PushError { index, reason });
      }
    }

    appsrc
      .end_of_stream()
      .map_err(|e| GStreamerVideoSinkError::PipelineError(format!("发送 EOS 失败: {:?}", e)))?;

    wait_for_eos(pipeline)
  }
}

impl VideoSink for GStreamerVideoSink {
  type Error = GStreamerVideoSinkError;

  fn write_video(&self, frames: &[BgrFrame], path: &Path, fps: f64) -> Result<(), Self::Error> {
    let Some(first) = frames.first() else {
      warn!("没有可写入的帧，跳过视频输出");
      return Ok(());
    };
    if !fps.is_finite() || fps <= 0.0 {
      return Err(GStreamerVideoSinkError::InvalidFrameRate(fps));
    }
    let location = path
      .to_str()
      .ok_or_else(|| GStreamerVideoSinkError::InvalidPath(path.display().to_string()))?;

    // 多次调用是安全的
    gst::init()?;

    let container = Container::from_path(path);
    let description = container.pipeline_description();
    info!("创建视频输出管道: {}", description);

    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoSinkError::PipelineError("无法创建管道".to_string()))?;

    pipeline
      .by_name("sink")
      .ok_or(GStreamerVideoSinkError::ElementNotFound("sink"))?
      .set_property("location", location);

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoSinkError::ElementNotFound("src"))?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoSinkError::ElementNotFound("src"))?;

    let (width, height) = encoded_size(first.width(), first.height());
    let caps = output_caps(width, height, fps);
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    // 编码器跟不上时阻塞推送，避免整段视频堆积在队列里
    appsrc.set_property("block", true);

    if (width, height) != (first.width(), first.height()) {
      info!(
        "帧尺寸 {}x{} 不是偶数，编码尺寸调整为 {}x{}",
        first.width(),
        first.height(),
        width,
        height
      );
    }
    info!(
      "视频输出: {}x{} @ {} fps, {} 帧 -> {}",
      width,
      height,
      fps,
      frames.len(),
      location
    );

    let result = self.encode(&pipeline, &appsrc, frames, fps);

    if let Err(e) = pipeline.set_state(gst::State::Null) {
      warn!("停止视频输出管道失败: {}", e);
    }

    match result {
      Ok(()) => {
        info!("视频写入完成: {}", location);
        Ok(())
      }
      Err(e) => {
        error!("视频写入失败: {}", e);
        if path.exists() {
          match std::fs::remove_file(path) {
            Ok(()) => debug!("已删除不完整的输出文件: {}", location),
            Err(e) => warn!("删除不完整的输出文件失败: {}", e),
          }
        }
        Err(e)
      }
    }
  }
}

/// 4:2:0 色度抽样要求的偶数尺寸，向下取整且不小于 2
fn encoded_size(width: u32, height: u32) -> (u32, u32) {
  ((width & !1).max(2), (height & !1).max(2))
}

fn output_caps(width: u32, height: u32, fps: f64) -> gst::Caps {
  gst::Caps::builder("video/x-raw")
    .field("format", "BGR")
    .field("width", width as i32)
    .field("height", height as i32)
    .field("framerate", gst::Fraction::new((fps * 1000.0).round() as i32, 1000))
    .build()
}

/// 调整为编码尺寸：只多出一行或一列时裁掉，其余情况重采样
fn fit_frame(index: usize, frame: &BgrFrame, width: u32, height: u32) -> Cow<'_, BgrFrame> {
  let (w, h) = (frame.width(), frame.height());
  if (w, h) == (width, height) {
    return Cow::Borrowed(frame);
  }
  if (w == width || w == width + 1) && (h == height || h == height + 1) {
    if let Some(cropped) = crop_top_left(frame, width, height) {
      return Cow::Owned(cropped);
    }
  }
  warn!(
    "第 {} 帧尺寸 {} 与编码尺寸 {}x{} 不一致，调整后写入",
    index,
    frame.shape(),
    width,
    height
  );
  Cow::Owned(frame.resized(width, height))
}

fn crop_top_left(frame: &BgrFrame, width: u32, height: u32) -> Option<BgrFrame> {
  let row = frame.width() as usize * frame.channels();
  let keep = width as usize * frame.channels();
  if row == 0 || keep > row {
    return None;
  }
  let data = frame
    .as_raw()
    .chunks_exact(row)
    .take(height as usize)
    .flat_map(|line| &line[..keep])
    .copied()
    .collect();
  BgrFrame::from_raw(width, height, data)
}

fn make_buffer(data: &[u8], pts: u64, duration: u64) -> Result<gst::Buffer, GStreamerVideoSinkError> {
  let mut buffer =
    gst::Buffer::with_size(data.len()).map_err(|_| GStreamerVideoSinkError::BufferCreationError)?;
  {
    let buffer_ref = buffer
      .get_mut()
      .ok_or(GStreamerVideoSinkError::BufferCreationError)?;
    buffer_ref.set_pts(gst::ClockTime::from_nseconds(pts));
    buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration));
    let mut map = buffer_ref
      .map_writable()
      .map_err(|_| GStreamerVideoSinkError::BufferCreationError)?;
    map.copy_from_slice(data);
  }
  Ok(buffer)
}

fn wait_for_eos(pipeline: &gst::Pipeline) -> Result<(), GStreamerVideoSinkError> {
  let bus = pipeline
    .bus()
    .ok_or_else(|| GStreamerVideoSinkError::PipelineError("管道没有消息总线".to_string()))?;

  for msg in bus.iter_timed(gst::ClockTime::NONE) {
    use gst::MessageView;

    match msg.view() {
      MessageView::Eos(..) => return Ok(()),
      MessageView::Error(err) => {
        return Err(GStreamerVideoSinkError::PipelineError(format!(
          "{} ({:?})",
          err.error(),
          err.debug()
        )));
      }
      _ => {}
    }
  }

  Err(GStreamerVideoSinkError::PipelineError(
    "消息总线提前关闭".to_string(),
  ))
}

fn pending_bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let msg = pipeline
    .bus()?
    .timed_pop_filtered(gst::ClockTime::from_seconds(1), &[gst::MessageType::Error])?;
  match msg.view() {
    gst::MessageView::Error(err) => Some(err.error().to_string()),
    _ => None,
  }
}
