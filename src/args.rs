// 该文件是 Biaozhi （标志） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::{num::NonZeroUsize, path::PathBuf};

use biaozhi::{model::Device, task::PipelineConfig};
use clap::{Parser, ValueEnum};

/// 统计结果的输出格式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
  #[default]
  Text,
  Json,
}

/// Biaozhi 交通标志批量检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频文件路径
  #[arg(long, value_name = "FILE")]
  pub video: PathBuf,

  /// 输出视频文件路径（.mp4 / .mkv / .avi）
  #[arg(long, default_value = "output.mp4", value_name = "FILE")]
  pub output: PathBuf,

  /// ONNX 模型文件路径
  #[arg(long, default_value = "models/yolov11n.onnx", value_name = "FILE")]
  pub model: PathBuf,

  /// 每批帧数
  #[arg(long, default_value = "16", value_name = "COUNT")]
  pub batch_size: NonZeroUsize,

  /// 推理设备：cpu、cuda、cuda:N 或 GPU 序号
  #[arg(long, default_value = "cpu", value_name = "DEVICE")]
  pub device: Device,

  /// 输出视频帧率
  #[arg(long, default_value = "30", value_name = "FPS", value_parser = parse_fps)]
  pub fps: f64,

  /// 并行推理线程数
  #[arg(long, default_value = "1", value_name = "COUNT")]
  pub workers: NonZeroUsize,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 模型输入边长（像素）
  #[arg(long, default_value = "640", value_name = "PIXELS")]
  pub input_size: u32,

  /// 统计结果格式
  #[arg(long, value_enum, default_value_t = StatsFormat::Text)]
  pub stats_format: StatsFormat,
}

/// 帧率必须是有限的正数
fn parse_fps(value: &str) -> Result<f64, String> {
  let fps: f64 = value
    .parse()
    .map_err(|e| format!("无效的帧率 {}: {}", value, e))?;
  if fps.is_finite() && fps > 0.0 {
    Ok(fps)
  } else {
    Err(format!("帧率必须大于 0，得到 {}", value))
  }
}

impl Args {
  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      batch_size: self.batch_size,
      device: self.device,
      fps: self.fps,
      workers: self.workers,
    }
  }
}
