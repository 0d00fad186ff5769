// 该文件是 Biaozhi （标志） 项目的一部分。
// src/output/draw.rs - 检测结果标注
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

use ab_glyph::{FontRef, InvalidFont, PxScale};
use image::Rgb;
use imageproc::{
  drawing::{draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};

use crate::{
  frame::BgrFrame,
  model::{DetectResult, Detection, class_name},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_GAP: i32 = 10; // 标签与边框上沿的距离
const BOX_THICKNESS: i32 = 2;

/// 类别颜色（BGR）
const CLASS_COLORS: [(&str, [u8; 3]); 6] = [
  ("stop_sign", [0, 0, 255]),
  ("speed_limit", [0, 255, 0]),
  ("yield", [255, 0, 0]),
  ("traffic_light", [0, 255, 255]),
  ("pedestrian_crossing", [255, 0, 255]),
  ("no_entry", [255, 255, 0]),
];
const DEFAULT_COLOR: [u8; 3] = [255, 255, 255];

/// 按类别名称取颜色，未知类别为白色
pub fn class_color(name: &str) -> [u8; 3] {
  CLASS_COLORS
    .iter()
    .find(|(class, _)| *class == name)
    .map(|(_, color)| *color)
    .unwrap_or(DEFAULT_COLOR)
}

/// 在帧的副本上绘制检测框与标签
pub struct FrameAnnotator<'a> {
  font: FontRef<'a>,
  font_size: f32,
}

impl FrameAnnotator<'static> {
  pub fn new() -> Result<Self, InvalidFont> {
    let font_data = include_bytes!("../../assets/DejaVuSans.ttf");
    Ok(Self {
      font: FontRef::try_from_slice(font_data)?,
      font_size: LABEL_FONT_SIZE,
    })
  }
}

impl<'a> FrameAnnotator<'a> {
  pub fn annotate(&self, frame: &BgrFrame, result: Option<&DetectResult>) -> BgrFrame {
    let mut annotated = frame.clone();
    if let Some(result) = result {
      for detection in result.items.iter() {
        self.draw_detection(&mut annotated, detection);
      }
    }
    annotated
  }

  fn draw_detection(&self, frame: &mut BgrFrame, detection: &Detection) {
    let (w, h) = (frame.width() as i32, frame.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (detection.bbox[0] as i32).clamp(0, w - 1);
    let y_min = (detection.bbox[1] as i32).clamp(0, h - 1);
    let x_max = (detection.bbox[2] as i32).clamp(0, w - 1);
    let y_max = (detection.bbox[3] as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let name = class_name(detection.class_id);
    let color = Rgb(class_color(&name));
    let image = frame.buffer_mut();

    // 边框向内加粗
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min + 1 - 2 * t;
      let height = y_max - y_min + 1 - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, color);
    }

    let label = format!("{}: {:.2}", name, detection.confidence);
    let label_y = (y_min - LABEL_GAP - self.font_size as i32).clamp(0, (h - 1).max(0));
    draw_text_mut(
      image,
      color,
      x_min,
      label_y,
      PxScale::from(self.font_size),
      &self.font,
      &label,
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn detection(class_id: u32, bbox: [f32; 4]) -> DetectResult {
    DetectResult::from(vec![Detection {
      class_id,
      confidence: 0.87,
      bbox,
    }])
  }

  #[test]
  fn color_table_lookup() {
    assert_eq!(class_color("stop_sign"), [0, 0, 255]);
    assert_eq!(class_color("no_entry"), [255, 255, 0]);
    assert_eq!(class_color("Class 9"), [255, 255, 255]);
  }

  #[test]
  fn absent_or_empty_result_is_identical_copy() {
    let annotator = FrameAnnotator::new().unwrap();
    let frame = BgrFrame::filled(32, 24, [7, 8, 9]);
    assert_eq!(annotator.annotate(&frame, None), frame);
    assert_eq!(
      annotator.annotate(&frame, Some(&DetectResult::default())),
      frame
    );
  }

  #[test]
  fn box_is_drawn_in_class_color_with_two_pixel_border() {
    let annotator = FrameAnnotator::new().unwrap();
    let frame = BgrFrame::filled(100, 100, [0, 0, 0]);
    let result = detection(0, [40.0, 60.0, 80.0, 90.0]);

    let annotated = annotator.annotate(&frame, Some(&result));

    assert_eq!(annotated.shape(), frame.shape());
    assert_eq!(annotated.pixel(40, 60), [0, 0, 255]);
    assert_eq!(annotated.pixel(41, 61), [0, 0, 255]);
    assert_eq!(annotated.pixel(80, 90), [0, 0, 255]);
    assert_eq!(annotated.pixel(60, 75), [0, 0, 0]);
    // 输入帧保持不变
    assert_eq!(frame.pixel(40, 60), [0, 0, 0]);
  }

  #[test]
  fn unknown_class_is_white() {
    let annotator = FrameAnnotator::new().unwrap();
    let frame = BgrFrame::filled(100, 100, [0, 0, 0]);
    let annotated = annotator.annotate(&frame, Some(&detection(9, [40.0, 60.0, 80.0, 90.0])));
    assert_eq!(annotated.pixel(40, 60), [255, 255, 255]);
  }

  #[test]
  fn out_of_bounds_box_is_clamped() {
    let annotator = FrameAnnotator::new().unwrap();
    let frame = BgrFrame::filled(20, 10, [0, 0, 0]);
    let annotated = annotator.annotate(&frame, Some(&detection(1, [-5.0, -5.0, 50.0, 50.0])));
    assert_eq!(annotated.pixel(19, 9), [0, 255, 0]);
  }

  #[test]
  fn degenerate_box_is_skipped() {
    let annotator = FrameAnnotator::new().unwrap();
    let frame = BgrFrame::filled(20, 10, [0, 0, 0]);
    let annotated = annotator.annotate(&frame, Some(&detection(1, [5.0, 5.0, 5.0, 8.0])));
    assert_eq!(annotated, frame);
  }
}
