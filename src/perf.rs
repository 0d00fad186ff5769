// 该文件是 Biaozhi （标志） 项目的一部分。
// src/perf.rs - 推理耗时统计
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
  num::NonZeroUsize,
  sync::{Mutex, PoisonError},
  time::Duration,
};

use serde_json::{Value, json};

/// 每个成功批次记录一次推理耗时（秒）
#[derive(Debug)]
pub struct PerformanceTracker {
  batch_size: NonZeroUsize,
  samples: Mutex<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceSummary {
  pub average_duration: f64,
  pub batch_count: usize,
  pub estimated_fps: f64,
  /// 按 `batch_count * batch_size` 估算，末尾不满的批次也按满批计
  pub total_frames_estimate: usize,
}

impl PerformanceTracker {
  pub fn new(batch_size: NonZeroUsize) -> Self {
    Self {
      batch_size,
      samples: Mutex::new(Vec::new()),
    }
  }

  pub fn record(&self, duration_seconds: f64) {
    // 锁中毒时样本仍然有效，继续追加
    let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
    samples.push(duration_seconds);
  }

  pub fn record_duration(&self, duration: Duration) {
    self.record(duration.as_secs_f64());
  }

  pub fn batch_count(&self) -> usize {
    self
      .samples
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .len()
  }

  pub fn summary(&self) -> PerformanceSummary {
    let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
    let batch_count = samples.len();
    let batch_size = self.batch_size.get();

    let average_duration = if batch_count == 0 {
      0.0
    } else {
      samples.iter().sum::<f64>() / batch_count as f64
    };
    let estimated_fps = if average_duration > 0.0 {
      batch_size as f64 / average_duration
    } else {
      0.0
    };

    PerformanceSummary {
      average_duration,
      batch_count,
      estimated_fps,
      total_frames_estimate: batch_count * batch_size,
    }
  }
}

impl PerformanceSummary {
  pub fn to_json(&self) -> Value {
    json!({
      "average_batch_seconds": self.average_duration,
      "batch_count": self.batch_count,
      "estimated_fps": self.estimated_fps,
      "total_frames_estimate": self.total_frames_estimate,
    })
  }
}
