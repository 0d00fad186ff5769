// 该文件是 Biaozhi （标志） 项目的一部分。
// src/batch.rs - 批次组装与结果映射
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

//! # 批次
//!
//! 把解码得到的帧序列按固定大小切分为批次，并把批次内的检测结果
//! 映射回绝对帧序号。
//!
//! 同一批次内的帧必须形状一致才能堆叠。形状不一致时以批次第一帧为准，
//! 其余帧重采样到该尺寸；如果堆叠仍然失败，整个批次被跳过，
//! 但后续批次的绝对帧序号不受影响。

use std::{borrow::Cow, num::NonZeroUsize};

use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayView3, Axis, ShapeError, s};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{BgrFrame, FrameShape},
  model::DetectResult,
};

#[derive(Error, Debug)]
pub enum BatchError {
  #[error("批次 {index} 为空")]
  Empty { index: usize },
  #[error("批次 {index} 的基准帧形状无效: {shape}")]
  DegenerateShape { index: usize, shape: FrameShape },
  #[error("批次 {index} 堆叠失败: {source}")]
  ShapeConflict {
    index: usize,
    #[source]
    source: ShapeError,
  },
}

/// 形状一致的一组帧，堆叠为 `(N, H, W, C)` 数组
#[derive(Debug, Clone)]
pub struct Batch {
  index: usize,
  data: Array4<u8>,
}

impl Batch {
  /// 将已经对齐形状的帧堆叠成批次
  pub fn stack(index: usize, frames: &[BgrFrame]) -> Result<Self, BatchError> {
    let first = frames.first().ok_or(BatchError::Empty { index })?;
    let canonical = first.shape();
    if canonical.area() == 0 {
      return Err(BatchError::DegenerateShape {
        index,
        shape: canonical,
      });
    }

    let views = frames
      .iter()
      .map(|frame| {
        let shape = frame.shape();
        ArrayView3::from_shape(
          (shape.height as usize, shape.width as usize, shape.channels),
          frame.as_raw(),
        )
      })
      .collect::<Result<Vec<_>, _>>()
      .map_err(|source| BatchError::ShapeConflict { index, source })?;

    let data = ndarray::stack(Axis(0), &views)
      .map_err(|source| BatchError::ShapeConflict { index, source })?;

    Ok(Self { index, data })
  }

  /// 批次在切分序列中的序号，乘以批次大小即为基准帧序号
  pub fn index(&self) -> usize {
    self.index
  }

  pub fn len(&self) -> usize {
    self.data.len_of(Axis(0))
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn frame_shape(&self) -> FrameShape {
    let (_, height, width, channels) = self.data.dim();
    FrameShape {
      height: height as u32,
      width: width as u32,
      channels,
    }
  }

  /// 取出批次中第 `offset` 帧的副本
  pub fn frame(&self, offset: usize) -> Option<BgrFrame> {
    if offset >= self.len() {
      return None;
    }
    let shape = self.frame_shape();
    let view = self.data.index_axis(Axis(0), offset);
    BgrFrame::from_raw(shape.width, shape.height, view.iter().copied().collect())
  }

  /// 将每一帧的通道顺序反转（BGR -> RGB），供检测模型使用
  pub fn to_rgb_images(&self) -> Vec<RgbImage> {
    let shape = self.frame_shape();
    self
      .data
      .axis_iter(Axis(0))
      .map(|frame| {
        let reversed = frame.slice(s![.., .., ..;-1]);
        RgbImage::from_fn(shape.width, shape.height, |x, y| {
          let (x, y) = (x as usize, y as usize);
          Rgb([reversed[[y, x, 0]], reversed[[y, x, 1]], reversed[[y, x, 2]]])
        })
      })
      .collect()
  }
}

/// 批次组装器
#[derive(Debug, Clone, Copy)]
pub struct BatchAssembler {
  batch_size: NonZeroUsize,
}

impl BatchAssembler {
  pub fn new(batch_size: NonZeroUsize) -> Self {
    Self { batch_size }
  }

  /// 按顺序切分帧序列；第 `i` 组覆盖 `[i * batch_size, i * batch_size + len)`
  pub fn assemble(&self, frames: &[BgrFrame]) -> Vec<Batch> {
    if frames.is_empty() {
      warn!("帧序列为空，没有可创建的批次");
      return Vec::new();
    }

    let mut batches = Vec::with_capacity(frames.len().div_ceil(self.batch_size.get()));
    for (index, group) in frames.chunks(self.batch_size.get()).enumerate() {
      let group = reconcile_shapes(index, group);
      match Batch::stack(index, &group) {
        Ok(batch) => batches.push(batch),
        Err(e) => {
          let shapes: Vec<String> = group.iter().map(|f| f.shape().to_string()).collect();
          warn!("创建批次出错: {}，帧形状: [{}]", e, shapes.join(", "));
        }
      }
    }

    info!(
      "创建了 {} 个批次，批次大小 {}",
      batches.len(),
      self.batch_size
    );
    batches
  }
}

/// 以第一帧形状为准，对齐同组其余帧
fn reconcile_shapes(index: usize, group: &[BgrFrame]) -> Cow<'_, [BgrFrame]> {
  let Some(first) = group.first() else {
    return Cow::Borrowed(group);
  };
  let target = first.shape();

  if group.iter().all(|frame| frame.shape() == target) {
    return Cow::Borrowed(group);
  }

  warn!("批次 {} 中的帧尺寸不一致，统一调整为 {}", index, target);
  if target.area() == 0 {
    return Cow::Borrowed(group);
  }

  Cow::Owned(
    group
      .iter()
      .map(|frame| {
        if frame.shape() == target {
          frame.clone()
        } else {
          debug!("帧尺寸 {} -> {}", frame.shape(), target);
          frame.resized(target.width, target.height)
        }
      })
      .collect(),
  )
}

/// 批次内偏移映射到的绝对帧
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedFrame<'a> {
  pub index: usize,
  pub result: Option<&'a DetectResult>,
}

/// 把 `(批次序号, 批次内偏移)` 还原为绝对帧序号
#[derive(Debug, Clone, Copy)]
pub struct ResultMapper {
  batch_size: NonZeroUsize,
  frame_count: usize,
}

impl ResultMapper {
  pub fn new(batch_size: NonZeroUsize, frame_count: usize) -> Self {
    Self {
      batch_size,
      frame_count,
    }
  }

  /// 绝对帧序号；超出原始帧序列范围时返回 `None`
  pub fn absolute_index(&self, batch_index: usize, offset: usize) -> Option<usize> {
    batch_index
      .checked_mul(self.batch_size.get())
      .and_then(|base| base.checked_add(offset))
      .filter(|index| *index < self.frame_count)
  }

  /// 结果序列短于批次时，对应帧的检测结果为 `None`
  pub fn map<'a>(
    &self,
    batch_index: usize,
    offset: usize,
    results: &'a [DetectResult],
  ) -> Option<MappedFrame<'a>> {
    let index = self.absolute_index(batch_index, offset)?;
    Some(MappedFrame {
      index,
      result: results.get(offset),
    })
  }

  pub fn map_batch<'a>(
    &self,
    batch: &Batch,
    results: &'a [DetectResult],
  ) -> impl Iterator<Item = MappedFrame<'a>> + use<'a> {
    let mapper = *self;
    let batch_index = batch.index();
    (0..batch.len()).filter_map(move |offset| {
      let mapped = mapper.map(batch_index, offset, results);
      if mapped.is_none() {
        warn!(
          "批次 {} 偏移 {} 超出帧序列范围，已丢弃",
          batch_index, offset
        );
      }
      mapped
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Detection;

  fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
  }

  /// 每帧以序号作为像素值，便于核对顺序
  fn numbered_frames(count: usize, width: u32, height: u32) -> Vec<BgrFrame> {
    (0..count)
      .map(|i| BgrFrame::filled(width, height, [i as u8, (i * 2) as u8, (i * 3) as u8]))
      .collect()
  }

  #[test]
  fn empty_input_yields_no_batches() {
    assert!(BatchAssembler::new(nz(4)).assemble(&[]).is_empty());
  }

  #[test]
  fn batch_count_is_ceiling_and_order_is_preserved() {
    for (count, size) in [(1, 1), (7, 3), (16, 16), (40, 16), (5, 8)] {
      let frames = numbered_frames(count, 4, 3);
      let batches = BatchAssembler::new(nz(size)).assemble(&frames);
      assert_eq!(batches.len(), count.div_ceil(size));

      let restored: Vec<BgrFrame> = batches
        .iter()
        .flat_map(|b| (0..b.len()).filter_map(move |j| b.frame(j)))
        .collect();
      assert_eq!(restored, frames);
    }
  }

  #[test]
  fn last_batch_may_be_short() {
    let frames = numbered_frames(40, 2, 2);
    let sizes: Vec<usize> = BatchAssembler::new(nz(16))
      .assemble(&frames)
      .iter()
      .map(Batch::len)
      .collect();
    assert_eq!(sizes, vec![16, 16, 8]);
  }

  #[test]
  fn uniform_shapes_survive_bitwise() {
    let frames = numbered_frames(3, 5, 4);
    let batch = &BatchAssembler::new(nz(3)).assemble(&frames)[0];
    for (j, frame) in frames.iter().enumerate() {
      assert_eq!(batch.frame(j).as_ref(), Some(frame));
    }
  }

  #[test]
  fn mismatched_frames_are_resized_to_first() {
    let frames = vec![
      BgrFrame::filled(6, 4, [1, 1, 1]),
      BgrFrame::filled(12, 8, [2, 2, 2]),
      BgrFrame::filled(3, 9, [3, 3, 3]),
    ];
    let batches = BatchAssembler::new(nz(3)).assemble(&frames);
    assert_eq!(batches.len(), 1);

    let batch = &batches[0];
    assert_eq!(batch.frame_shape(), frames[0].shape());
    assert_eq!(batch.frame(0).as_ref(), Some(&frames[0]));
    for j in 1..3 {
      let frame = batch.frame(j).unwrap();
      assert_eq!(frame.shape(), frames[0].shape());
      // 纯色帧重采样后颜色不变
      assert_eq!(frame.pixel(0, 0), frames[j].pixel(0, 0));
    }
  }

  #[test]
  fn degenerate_group_is_dropped_without_shifting_later_batches() {
    let mut frames = numbered_frames(6, 4, 4);
    frames[2] = BgrFrame::filled(0, 0, [0, 0, 0]);
    let batches = BatchAssembler::new(nz(2)).assemble(&frames);

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].index(), 0);
    assert_eq!(batches[1].index(), 2);
    assert_eq!(batches[1].frame(0).as_ref(), Some(&frames[4]));
  }

  #[test]
  fn rgb_conversion_reverses_channels() {
    let frames = vec![BgrFrame::filled(2, 2, [10, 20, 30])];
    let batch = Batch::stack(0, &frames).unwrap();
    let images = batch.to_rgb_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].get_pixel(1, 0).0, [30, 20, 10]);
  }

  #[test]
  fn stacking_an_empty_group_fails() {
    assert!(matches!(
      Batch::stack(3, &[]),
      Err(BatchError::Empty { index: 3 })
    ));
  }

  #[test]
  fn mapper_round_trip_reconstructs_frame_order() {
    let (count, size) = (40, 16);
    let mapper = ResultMapper::new(nz(size), count);
    let mut indices = Vec::new();
    for batch_index in 0..count.div_ceil(size) {
      for offset in 0..size {
        if let Some(index) = mapper.absolute_index(batch_index, offset) {
          assert_eq!(index, batch_index * size + offset);
          indices.push(index);
        }
      }
    }
    assert_eq!(indices, (0..count).collect::<Vec<_>>());
  }

  #[test]
  fn short_results_map_to_none() {
    let mapper = ResultMapper::new(nz(4), 8);
    let results = vec![DetectResult::from(vec![Detection {
      class_id: 0,
      confidence: 0.5,
      bbox: [0.0, 0.0, 1.0, 1.0],
    }])];

    let first = mapper.map(1, 0, &results).unwrap();
    assert_eq!(first.index, 4);
    assert!(first.result.is_some());

    let second = mapper.map(1, 3, &results).unwrap();
    assert_eq!(second.index, 7);
    assert!(second.result.is_none());
  }

  #[test]
  fn out_of_range_pairs_are_discarded() {
    let mapper = ResultMapper::new(nz(16), 40);
    assert!(mapper.map(2, 8, &[]).is_none());
    assert!(mapper.map(usize::MAX, 1, &[]).is_none());
  }

  #[test]
  fn map_batch_covers_every_frame_of_the_batch() {
    let frames = numbered_frames(5, 2, 2);
    let batches = BatchAssembler::new(nz(3)).assemble(&frames);
    let mapper = ResultMapper::new(nz(3), frames.len());
    let indices: Vec<usize> = mapper
      .map_batch(&batches[1], &[])
      .map(|mapped| mapped.index)
      .collect();
    assert_eq!(indices, vec![3, 4]);
  }
}
