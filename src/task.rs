// 该文件是 Biaozhi （标志） 项目的一部分。
// src/task.rs - 批量检测任务
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
  fmt::{self, Display},
  num::NonZeroUsize,
  path::{Path, PathBuf},
  sync::atomic::{AtomicUsize, Ordering},
  thread,
  time::{Duration, Instant},
};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  batch::{Batch, BatchAssembler, ResultMapper},
  detector::DetectionOrchestrator,
  frame::BgrFrame,
  model::{DetectResult, Device, Model},
  output::{VideoSink, draw::FrameAnnotator},
  perf::{PerformanceSummary, PerformanceTracker},
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub batch_size: NonZeroUsize,
  pub device: Device,
  pub fps: f64,
  /// 并行推理的线程数，1 为顺序执行
  pub workers: NonZeroUsize,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      batch_size: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
      device: Device::Cpu,
      fps: 30.0,
      workers: NonZeroUsize::MIN,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  Loaded,
  Batched,
  Detecting,
  Annotated,
  Encoded,
  Done,
}

impl Display for PipelineState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PipelineState::Idle => "空闲",
      PipelineState::Loaded => "已加载",
      PipelineState::Batched => "已分批",
      PipelineState::Detecting => "检测中",
      PipelineState::Annotated => "已标注",
      PipelineState::Encoded => "已编码",
      PipelineState::Done => "完成",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbortReason {
  #[error("没有解码出任何帧")]
  NoFrames,
  #[error("没有创建任何批次")]
  NoBatches,
  #[error("没有可写入的标注帧")]
  NoAnnotatedFrames,
  #[error("视频写入失败: {0}")]
  EncodeFailed(String),
}

#[derive(Error, Debug)]
pub enum TaskError {
  #[error("任务在「{state}」阶段中止: {reason}")]
  Aborted {
    state: PipelineState,
    reason: AbortReason,
  },
  #[error("无法加载标注字体: {0}")]
  Font(#[from] ab_glyph::InvalidFont),
}

impl TaskError {
  pub fn abort_reason(&self) -> Option<&AbortReason> {
    match self {
      TaskError::Aborted { reason, .. } => Some(reason),
      TaskError::Font(_) => None,
    }
  }
}

/// 一次完整运行的统计
#[derive(Debug, Clone)]
pub struct TaskReport {
  pub frames_loaded: usize,
  pub batches_created: usize,
  pub frames_processed: usize,
  pub total_time: Duration,
  pub performance: PerformanceSummary,
  pub output: PathBuf,
}

impl TaskReport {
  /// 以总耗时计算的整体吞吐
  pub fn overall_fps(&self) -> f64 {
    let secs = self.total_time.as_secs_f64();
    if secs > 0.0 {
      self.frames_processed as f64 / secs
    } else {
      0.0
    }
  }

  pub fn to_json(&self) -> Value {
    json!({
      "output": self.output.display().to_string(),
      "frames_loaded": self.frames_loaded,
      "batches_created": self.batches_created,
      "frames_processed": self.frames_processed,
      "total_seconds": self.total_time.as_secs_f64(),
      "overall_fps": self.overall_fps(),
      "performance": self.performance.to_json(),
    })
  }
}

/// 解码 -> 分批 -> 检测 -> 标注 -> 编码
pub struct BatchTask {
  config: PipelineConfig,
  output_path: PathBuf,
}

impl BatchTask {
  pub fn new(config: PipelineConfig, output_path: impl Into<PathBuf>) -> Self {
    Self {
      config,
      output_path: output_path.into(),
    }
  }
}

struct StateMachine {
  state: PipelineState,
}

impl StateMachine {
  fn advance(&mut self, next: PipelineState) {
    debug!("状态转移: {} -> {}", self.state, next);
    self.state = next;
  }

  fn abort(&self, reason: AbortReason) -> TaskError {
    error!("任务中止（{}）: {}", self.state, reason);
    TaskError::Aborted {
      state: self.state,
      reason,
    }
  }
}

impl<I, M, O> Task<I, M, O> for BatchTask
where
  I: Iterator<Item = BgrFrame>,
  M: Model + Sync,
  M::Error: Display,
  O: VideoSink,
  O::Error: Display,
{
  type Output = TaskReport;
  type Error = TaskError;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    let start = Instant::now();
    let config = self.config;
    let mut machine = StateMachine {
      state: PipelineState::Idle,
    };
    let annotator = FrameAnnotator::new()?;

    info!("开始任务...");
    let frames: Vec<BgrFrame> = input.collect();
    if frames.is_empty() {
      return Err(machine.abort(AbortReason::NoFrames));
    }
    let frame_count = frames.len();
    info!("共加载 {} 帧", frame_count);
    machine.advance(PipelineState::Loaded);

    let batches = BatchAssembler::new(config.batch_size).assemble(&frames);
    if batches.is_empty() {
      return Err(machine.abort(AbortReason::NoBatches));
    }
    machine.advance(PipelineState::Batched);

    machine.advance(PipelineState::Detecting);
    let tracker = PerformanceTracker::new(config.batch_size);
    let orchestrator = DetectionOrchestrator::new(&model, config.device, &tracker);
    let results = detect_all(&batches, &orchestrator, config.workers);

    let mapper = ResultMapper::new(config.batch_size, frame_count);
    let mut per_frame: Vec<Option<&DetectResult>> = vec![None; frame_count];
    for (batch, batch_results) in batches.iter().zip(&results) {
      for mapped in mapper.map_batch(batch, batch_results) {
        per_frame[mapped.index] = mapped.result;
      }
    }

    let annotated: Vec<BgrFrame> = frames
      .iter()
      .zip(per_frame)
      .map(|(frame, result)| annotator.annotate(frame, result))
      .collect();
    drop(frames);
    machine.advance(PipelineState::Annotated);

    encode(&mut machine, &annotated, &output, &self.output_path, config.fps)?;

    let report = TaskReport {
      frames_loaded: frame_count,
      batches_created: batches.len(),
      frames_processed: annotated.len(),
      total_time: start.elapsed(),
      performance: tracker.summary(),
      output: self.output_path,
    };
    machine.advance(PipelineState::Done);
    info!("任务完成，耗时: {:.2?}", report.total_time);

    Ok(report)
  }
}

/// `Annotated -> Encoded`
///
/// 经过 `Loaded` 的运行每帧都有一个标注帧，空序列只会来自直接调用。
fn encode<O>(
  machine: &mut StateMachine,
  annotated: &[BgrFrame],
  output: &O,
  path: &Path,
  fps: f64,
) -> Result<(), TaskError>
where
  O: VideoSink,
  O::Error: Display,
{
  if annotated.is_empty() {
    return Err(machine.abort(AbortReason::NoAnnotatedFrames));
  }

  info!("写入 {} 帧到 {}", annotated.len(), path.display());
  output
    .write_video(annotated, path, fps)
    .map_err(|e| machine.abort(AbortReason::EncodeFailed(e.to_string())))?;
  machine.advance(PipelineState::Encoded);
  Ok(())
}

/// 按批次顺序返回检测结果；`workers > 1` 时多线程共享批次游标
fn detect_all<M>(
  batches: &[Batch],
  orchestrator: &DetectionOrchestrator<'_, M>,
  workers: NonZeroUsize,
) -> Vec<Vec<DetectResult>>
where
  M: Model + Sync,
  M::Error: Display,
{
  let workers = workers.get().min(batches.len());
  if workers <= 1 {
    return batches
      .iter()
      .enumerate()
      .map(|(i, batch)| {
        info!("处理批次 {}/{}", i + 1, batches.len());
        orchestrator.run(batch)
      })
      .collect();
  }

  info!("使用 {} 个线程并行推理", workers);
  let cursor = AtomicUsize::new(0);
  let finished = thread::scope(|s| {
    let handles: Vec<_> = (0..workers)
      .map(|_| {
        s.spawn(|| {
          let mut done = Vec::new();
          loop {
            let slot = cursor.fetch_add(1, Ordering::Relaxed);
            let Some(batch) = batches.get(slot) else {
              break;
            };
            done.push((slot, orchestrator.run(batch)));
          }
          done
        })
      })
      .collect();

    handles
      .into_iter()
      .flat_map(|handle| {
        handle.join().unwrap_or_else(|_| {
          error!("推理线程异常退出，其批次按无检测结果处理");
          Vec::new()
        })
      })
      .collect::<Vec<_>>()
  });

  let mut results = vec![Vec::new(); batches.len()];
  for (slot, batch_results) in finished {
    results[slot] = batch_results;
  }
  if results.iter().any(Vec::is_empty) {
    warn!("部分批次没有检测结果");
  }
  results
}

#[cfg(test)]
mod tests {
  use std::{
    path::Path,
    sync::{Arc, Mutex},
  };

  use image::RgbImage;

  use super::*;
  use crate::model::Detection;

  #[derive(Clone, Default)]
  struct FixedModel {
    calls: Arc<AtomicUsize>,
  }

  impl Model for FixedModel {
    type Error = String;

    fn infer(&self, images: &[RgbImage], _device: &Device) -> Result<Vec<DetectResult>, String> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(
        images
          .iter()
          .map(|_| {
            DetectResult::from(vec![Detection {
              class_id: 2,
              confidence: 0.75,
              bbox: [40.0, 40.0, 50.0, 50.0],
            }])
          })
          .collect(),
      )
    }
  }

  #[derive(Clone, Default)]
  struct MemorySink {
    written: Arc<Mutex<Vec<BgrFrame>>>,
  }

  impl VideoSink for MemorySink {
    type Error = String;

    fn write_video(&self, frames: &[BgrFrame], _path: &Path, _fps: f64) -> Result<(), String> {
      self.written.lock().unwrap().extend_from_slice(frames);
      Ok(())
    }
  }

  struct FailingSink;

  impl VideoSink for FailingSink {
    type Error = String;

    fn write_video(&self, _frames: &[BgrFrame], _path: &Path, _fps: f64) -> Result<(), String> {
      Err("磁盘已满".to_string())
    }
  }

  fn config(batch_size: usize, workers: usize) -> PipelineConfig {
    PipelineConfig {
      batch_size: NonZeroUsize::new(batch_size).unwrap(),
      workers: NonZeroUsize::new(workers).unwrap(),
      ..PipelineConfig::default()
    }
  }

  fn frames(count: usize) -> Vec<BgrFrame> {
    (0..count)
      .map(|i| BgrFrame::filled(64, 64, [i as u8, 0, 0]))
      .collect()
  }

  #[test]
  fn empty_input_aborts_before_batching() {
    let sink = MemorySink::default();
    let err = BatchTask::new(config(4, 1), "out.mp4")
      .run_task(Vec::new().into_iter(), FixedModel::default(), sink.clone())
      .unwrap_err();
    assert_eq!(err.abort_reason(), Some(&AbortReason::NoFrames));
    assert!(sink.written.lock().unwrap().is_empty());
  }

  #[test]
  fn empty_annotated_sequence_aborts_before_encoding() {
    let sink = MemorySink::default();
    let mut machine = StateMachine {
      state: PipelineState::Annotated,
    };

    let err = encode(&mut machine, &[], &sink, Path::new("out.mp4"), 30.0).unwrap_err();
    assert!(matches!(
      err,
      TaskError::Aborted {
        state: PipelineState::Annotated,
        reason: AbortReason::NoAnnotatedFrames,
      }
    ));
    assert!(sink.written.lock().unwrap().is_empty());
  }

  #[test]
  fn encode_advances_to_encoded() {
    let sink = MemorySink::default();
    let mut machine = StateMachine {
      state: PipelineState::Annotated,
    };

    encode(&mut machine, &frames(2), &sink, Path::new("out.mp4"), 30.0).unwrap();
    assert_eq!(machine.state, PipelineState::Encoded);
    assert_eq!(sink.written.lock().unwrap().len(), 2);
  }

  #[test]
  fn sink_failure_is_reported_as_abort() {
    let err = BatchTask::new(config(4, 1), "out.mp4")
      .run_task(frames(5).into_iter(), FixedModel::default(), FailingSink)
      .unwrap_err();
    assert!(matches!(
      err,
      TaskError::Aborted {
        state: PipelineState::Annotated,
        reason: AbortReason::EncodeFailed(_),
      }
    ));
  }

  #[test]
  fn parallel_workers_keep_frame_order() {
    let model = FixedModel::default();
    let sink = MemorySink::default();
    let input = frames(23);

    let report = BatchTask::new(config(4, 3), "out.mp4")
      .run_task(input.clone().into_iter(), model.clone(), sink.clone())
      .unwrap();

    assert_eq!(model.calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.batches_created, 6);
    assert_eq!(report.performance.batch_count, 6);

    let written = sink.written.lock().unwrap();
    assert_eq!(written.len(), 23);
    for (i, frame) in written.iter().enumerate() {
      // 框外像素保留原始序号
      assert_eq!(frame.pixel(2, 60), input[i].pixel(2, 60));
      // yield 类别为蓝色 (BGR)
      assert_eq!(frame.pixel(40, 40), [255, 0, 0]);
    }
  }

  #[test]
  fn report_serialises_to_json() {
    let report = BatchTask::new(config(2, 1), "out.mp4")
      .run_task(frames(3).into_iter(), FixedModel::default(), MemorySink::default())
      .unwrap();
    let value = report.to_json();
    assert_eq!(value["frames_processed"], 3);
    assert_eq!(value["batches_created"], 2);
    assert_eq!(value["performance"]["total_frames_estimate"], 4);
  }
}
