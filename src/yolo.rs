// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! YOLOv5 detection head decoding for int8 models exported with the sigmoid
//! folded into the graph.
//!
//! Each of the three heads is an NCHW tensor `[1, 3 * (5 + classes), H, W]`
//! holding, per anchor and grid cell, the box offsets, the objectness and the
//! per-class probabilities. Comparisons against the confidence threshold are
//! done in the quantised domain; only surviving cells are dequantised.

use crate::{
    detect::{Decoder, Detection, ModelGeometry, QuantizedTensor, REQUIRED_OUTPUTS},
    error::{Error, Result},
};
use std::cmp::Ordering;

pub const OBJ_THRESH: f32 = 0.25;
pub const NMS_THRESH: f32 = 0.45;

/// Most detections reported for one frame, highest scores first.
pub const MAX_DETECTIONS: usize = 64;

const ANCHORS_PER_HEAD: usize = 3;

/// Anchor sizes in input pixels for the stride 8, 16 and 32 heads.
pub const ANCHORS: [[(f32, f32); ANCHORS_PER_HEAD]; 3] = [
    [(10.0, 13.0), (16.0, 30.0), (33.0, 23.0)],
    [(30.0, 61.0), (62.0, 45.0), (59.0, 119.0)],
    [(116.0, 90.0), (156.0, 198.0), (373.0, 326.0)],
];

pub const COCO_LABELS: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// A decoded box before suppression, in input pixels.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Intersection over union of two boxes.
pub fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Per-class greedy suppression. Returns the kept candidates, highest score
/// first.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(k, &candidate) > threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// The default detection decoder.
#[derive(Clone, Debug)]
pub struct Yolov5Decoder {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Yolov5Decoder {
    fn default() -> Self {
        Self {
            confidence: OBJ_THRESH,
            iou: NMS_THRESH,
        }
    }
}

impl Yolov5Decoder {
    pub fn label(class_id: usize) -> String {
        COCO_LABELS
            .get(class_id)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("class {class_id}"))
    }

    fn decode_head(
        &self,
        head: &QuantizedTensor<'_>,
        anchors: &[(f32, f32); ANCHORS_PER_HEAD],
        input: &ModelGeometry,
        candidates: &mut Vec<Candidate>,
    ) -> Result<()> {
        let &[_, channels, grid_h, grid_w] = head.dims else {
            return Err(Error::Inference(format!(
                "detection head has shape {:?}, expected 4 dimensions",
                head.dims
            )));
        };
        let (channels, grid_h, grid_w) = (channels as usize, grid_h as usize, grid_w as usize);
        let per_anchor = channels / ANCHORS_PER_HEAD;
        if per_anchor < 6 || channels % ANCHORS_PER_HEAD != 0 || grid_h == 0 || grid_w == 0 {
            return Err(Error::Inference(format!(
                "detection head shape {:?} does not hold {} anchors",
                head.dims, ANCHORS_PER_HEAD
            )));
        }
        let grid_len = grid_h * grid_w;
        if head.data.len() < channels * grid_len {
            return Err(Error::Inference(format!(
                "detection head holds {} values, shape {:?} needs {}",
                head.data.len(),
                head.dims,
                channels * grid_len
            )));
        }

        let classes = per_anchor - 5;
        let stride = input.height as f32 / grid_h as f32;
        let threshold = head.quantize(self.confidence);
        let at = |offset: usize| head.data[offset];

        for (a, &(anchor_w, anchor_h)) in anchors.iter().enumerate() {
            let anchor_base = a * per_anchor * grid_len;
            for i in 0..grid_h {
                for j in 0..grid_w {
                    let cell = anchor_base + i * grid_w + j;
                    let objectness = at(cell + 4 * grid_len);
                    if objectness < threshold {
                        continue;
                    }

                    let (class_id, class_prob) = (0..classes)
                        .map(|c| (c, at(cell + (5 + c) * grid_len)))
                        .fold((0, i8::MIN), |best, x| if x.1 > best.1 { x } else { best });
                    if class_prob <= threshold {
                        continue;
                    }

                    let bx = head.dequantize(at(cell)) * 2.0 - 0.5;
                    let by = head.dequantize(at(cell + grid_len)) * 2.0 - 0.5;
                    let bw = (head.dequantize(at(cell + 2 * grid_len)) * 2.0).powi(2) * anchor_w;
                    let bh = (head.dequantize(at(cell + 3 * grid_len)) * 2.0).powi(2) * anchor_h;
                    let cx = (bx + j as f32) * stride;
                    let cy = (by + i as f32) * stride;

                    candidates.push(Candidate {
                        class_id,
                        score: head.dequantize(class_prob) * head.dequantize(objectness),
                        x1: cx - bw / 2.0,
                        y1: cy - bh / 2.0,
                        x2: cx + bw / 2.0,
                        y2: cy + bh / 2.0,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Decoder for Yolov5Decoder {
    fn decode(
        &self,
        outputs: &[QuantizedTensor<'_>],
        input: &ModelGeometry,
    ) -> Result<Vec<Detection>> {
        if outputs.len() < REQUIRED_OUTPUTS {
            return Err(Error::OutputCount {
                found: outputs.len(),
                required: REQUIRED_OUTPUTS,
            });
        }

        let mut candidates = Vec::new();
        for (head, anchors) in outputs.iter().zip(ANCHORS.iter()) {
            self.decode_head(head, anchors, input, &mut candidates)?;
        }

        let (w, h) = (input.width as f32, input.height as f32);
        Ok(non_max_suppression(candidates, self.iou)
            .into_iter()
            .take(MAX_DETECTIONS)
            .map(|c| Detection {
                class_id: c.class_id,
                label: Self::label(c.class_id),
                confidence: c.score.clamp(0.0, 1.0),
                left: c.x1.clamp(0.0, w) as i32,
                top: c.y1.clamp(0.0, h) as i32,
                right: c.x2.clamp(0.0, w) as i32,
                bottom: c.y2.clamp(0.0, h) as i32,
            })
            .collect())
    }
}
