// 该文件是 Biaozhi （标志） 项目的一部分。
// src/detector.rs - 批次检测调度
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

use std::{fmt::Display, time::Instant};

use tracing::{error, info};

use crate::{
  batch::Batch,
  model::{DetectResult, Device, Model},
  perf::PerformanceTracker,
};

/// 每个批次调用一次检测模型
///
/// 推理失败只影响当前批次：记录错误并返回空结果，
/// 不向性能统计写入样本。
pub struct DetectionOrchestrator<'a, M> {
  model: &'a M,
  device: Device,
  tracker: &'a PerformanceTracker,
}

impl<'a, M> DetectionOrchestrator<'a, M>
where
  M: Model,
  M::Error: Display,
{
  pub fn new(model: &'a M, device: Device, tracker: &'a PerformanceTracker) -> Self {
    Self {
      model,
      device,
      tracker,
    }
  }

  pub fn run(&self, batch: &Batch) -> Vec<DetectResult> {
    if batch.is_empty() {
      return Vec::new();
    }

    let images = batch.to_rgb_images();
    let now = Instant::now();
    match self.model.infer(&images, &self.device) {
      Ok(results) => {
        let elapsed = now.elapsed();
        self.tracker.record_duration(elapsed);
        info!(
          "批次 {} 推理完成，{} 帧，耗时: {:.2?}",
          batch.index(),
          batch.len(),
          elapsed
        );
        results
      }
      Err(e) => {
        error!(
          "批次 {} 推理出错: {}，帧形状: {}",
          batch.index(),
          e,
          batch.frame_shape()
        );
        Vec::new()
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{cell::Cell, num::NonZeroUsize};

  use image::RgbImage;

  use super::*;
  use crate::{frame::BgrFrame, model::Detection};

  struct CountingModel {
    calls: Cell<usize>,
    fail: bool,
  }

  impl Model for CountingModel {
    type Error = String;

    fn infer(&self, images: &[RgbImage], _device: &Device) -> Result<Vec<DetectResult>, String> {
      self.calls.set(self.calls.get() + 1);
      if self.fail {
        return Err("模拟失败".to_string());
      }
      Ok(
        images
          .iter()
          .map(|image| {
            // 把左上角像素的 R 通道作为类别，验证通道顺序
            let class_id = image.get_pixel(0, 0).0[0] as u32;
            DetectResult::from(vec![Detection {
              class_id,
              confidence: 0.9,
              bbox: [0.0, 0.0, 1.0, 1.0],
            }])
          })
          .collect(),
      )
    }
  }

  fn tracker() -> PerformanceTracker {
    PerformanceTracker::new(NonZeroUsize::new(2).unwrap())
  }

  #[test]
  fn successful_batch_records_one_sample() {
    let model = CountingModel {
      calls: Cell::new(0),
      fail: false,
    };
    let tracker = tracker();
    let frames = vec![BgrFrame::filled(2, 2, [1, 2, 3]); 2];
    let batch = Batch::stack(0, &frames).unwrap();

    let results = DetectionOrchestrator::new(&model, Device::Cpu, &tracker).run(&batch);

    assert_eq!(model.calls.get(), 1);
    assert_eq!(results.len(), 2);
    // BGR [1, 2, 3] 反转后 R 通道为 3
    assert_eq!(results[0].items[0].class_id, 3);
    assert_eq!(tracker.batch_count(), 1);
  }

  #[test]
  fn failed_batch_yields_nothing_and_records_nothing() {
    let model = CountingModel {
      calls: Cell::new(0),
      fail: true,
    };
    let tracker = tracker();
    let frames = vec![BgrFrame::filled(2, 2, [0, 0, 0]); 2];
    let batch = Batch::stack(1, &frames).unwrap();

    let results = DetectionOrchestrator::new(&model, Device::Cpu, &tracker).run(&batch);

    assert_eq!(model.calls.get(), 1);
    assert!(results.is_empty());
    assert_eq!(tracker.batch_count(), 0);
  }
}
