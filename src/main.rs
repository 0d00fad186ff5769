// 该文件是 Biaozhi （标志） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use args::{Args, StatsFormat};
use biaozhi::{
  input::{FrameSource, FrameSourceError, GStreamerFrameSource},
  model::{YoloOnnxBuilder, YoloOnnxError},
  output::GStreamerVideoSink,
  task::{AbortReason, BatchTask, Task, TaskError, TaskReport},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  println!("Biaozhi 交通标志检测");
  println!("====================");
  println!("输入视频: {}", args.video.display());
  println!("输出视频: {}", args.output.display());
  println!("模型文件: {}", args.model.display());
  println!("批次大小: {}", args.batch_size);
  println!("推理设备: {}", args.device);
  println!();

  println!("正在加载模型...");
  let model = match YoloOnnxBuilder::new(&args.model)
    .device(args.device)
    .sessions(args.workers)
    .input_size(args.input_size)
    .confidence(args.confidence)
    .nms_threshold(args.nms_threshold)
    .build()
  {
    Ok(model) => model,
    Err(YoloOnnxError::ModelNotFound(path)) => {
      report_missing_model(&path);
      return Ok(());
    }
    Err(e) => return Err(e.into()),
  };
  println!("模型加载完成");

  println!("正在打开视频...");
  let frames = match GStreamerFrameSource::default().open(&args.video) {
    Ok(frames) => frames,
    Err(FrameSourceError::NotFound(path)) => {
      report_missing_video(&path);
      return Ok(());
    }
    Err(e @ FrameSourceError::UnreadableCodec { .. }) => {
      println!("错误: {}", e);
      println!("请确认视频编码为 H.264 (MP4/MKV/AVI) 且已安装相应的 GStreamer 插件。");
      println!("可以先用 ffmpeg 转换:");
      println!(
        "  ffmpeg -i {} -c:v libx264 -pix_fmt yuv420p converted.mp4",
        args.video.display()
      );
      return Ok(());
    }
  };

  let task = BatchTask::new(args.pipeline_config(), &args.output);
  match task.run_task(frames, model, GStreamerVideoSink) {
    Ok(report) => {
      print_report(&report, args.stats_format);
      Ok(())
    }
    Err(TaskError::Aborted { reason, .. }) => match reason {
      AbortReason::NoFrames => {
        println!("错误: 视频中没有解码出任何帧，请检查视频文件是否损坏。");
        Ok(())
      }
      AbortReason::NoBatches => {
        println!("错误: 没有创建任何批次，请检查视频帧尺寸。");
        Ok(())
      }
      AbortReason::NoAnnotatedFrames => {
        println!("错误: 没有处理任何帧，未写入输出视频。");
        Ok(())
      }
      reason @ AbortReason::EncodeFailed(_) => Err(reason.into()),
    },
    Err(e) => Err(e.into()),
  }
}

fn report_missing_model(path: &Path) {
  println!("错误: 找不到模型文件 {}", path.display());

  let dir = path
    .parent()
    .filter(|dir| !dir.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("models"));
  match list_dir(dir) {
    Ok(names) => {
      let models: Vec<String> = names
        .into_iter()
        .filter(|name| name.ends_with(".onnx"))
        .collect();
      if models.is_empty() {
        println!("目录 {} 中没有可用的 .onnx 模型", dir.display());
      } else {
        println!("目录 {} 中可用的模型:", dir.display());
        for name in models {
          println!("  - {}", name);
        }
      }
    }
    Err(e) => println!("无法读取模型目录 {}: {}", dir.display(), e),
  }
}

fn report_missing_video(path: &Path) {
  println!("错误: 找不到视频文件 {}", path.display());
  match std::env::current_dir() {
    Ok(cwd) => println!("当前目录: {}", cwd.display()),
    Err(e) => println!("无法获取当前目录: {}", e),
  }

  match list_dir(Path::new("data")) {
    Ok(names) => println!("data/ 目录内容: {:?}", names),
    Err(_) => println!("data/ 目录不存在"),
  }
}

/// 按名称排序的目录条目
fn list_dir(dir: &Path) -> std::io::Result<Vec<String>> {
  let mut names: Vec<String> = std::fs::read_dir(dir)?
    .filter_map(|entry| entry.ok())
    .map(|entry| entry.file_name().to_string_lossy().into_owned())
    .collect();
  names.sort();
  Ok(names)
}

fn print_report(report: &TaskReport, format: StatsFormat) {
  info!("输出文件: {}", report.output.display());
  match format {
    StatsFormat::Json => println!("{}", report.to_json()),
    StatsFormat::Text => {
      let perf = &report.performance;
      println!();
      println!("处理完成!");
      println!("总耗时: {:.2} 秒", report.total_time.as_secs_f64());
      println!("平均批次推理时间: {:.4} 秒", perf.average_duration);
      println!("单批次推理 FPS: {:.2}", perf.estimated_fps);
      println!("整体 FPS: {:.2}", report.overall_fps());
      println!("处理帧数: {}", report.frames_processed);
      println!("批次数: {}", perf.batch_count);
      println!("估算帧数: {}", perf.total_frames_estimate);
      println!("输出文件: {}", report.output.display());
    }
  }
}
