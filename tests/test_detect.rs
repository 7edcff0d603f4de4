// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use rkstream::{
    detect::{
        Decoder, Detection, InferenceBackend, InferenceSession, ModelGeometry, QuantizedTensor,
        TensorInfo, TensorLayout,
    },
    error::{Error, Result, Severity},
    yolo::{iou, non_max_suppression, Candidate, Yolov5Decoder, MAX_DETECTIONS},
};
use serial_test::serial;
use rockchip_sys::rknn::{rknn_tensor_attr, RKNN_MAX_NAME_LEN};
use std::{ffi::c_char, path::PathBuf, time::Instant};

fn tensor(index: u32, dims: &[u32], layout: TensorLayout) -> TensorInfo {
    let n_elems = dims.iter().product::<u32>() as usize;
    TensorInfo {
        index,
        name: format!("t{index}"),
        dims: dims.to_vec(),
        layout,
        n_elems,
        size: n_elems,
        zero_point: 0,
        scale: 1.0 / 128.0,
    }
}

#[test]
fn test_geometry() -> Result<()> {
    let nchw = ModelGeometry::from_input(&tensor(0, &[1, 3, 480, 640], TensorLayout::Nchw))?;
    assert_eq!((nchw.width, nchw.height, nchw.channels), (640, 480, 3));

    let nhwc = ModelGeometry::from_input(&tensor(0, &[1, 480, 640, 3], TensorLayout::Nhwc))?;
    assert_eq!((nhwc.width, nhwc.height, nhwc.channels), (640, 480, 3));
    assert_eq!(nhwc.input_size(), 640 * 480 * 3);

    assert!(matches!(
        ModelGeometry::from_input(&tensor(0, &[640, 480, 3], TensorLayout::Nhwc)),
        Err(Error::Inference(_))
    ));
    Ok(())
}

/// Writes a fixed pattern into every output and counts runs.
struct FakeBackend {
    input: TensorInfo,
    outputs: Vec<TensorInfo>,
    runs: usize,
    heads: Vec<Vec<i8>>,
}

impl FakeBackend {
    fn new(outputs: usize) -> Self {
        let outputs: Vec<TensorInfo> = (0..outputs)
            .map(|i| {
                let grid = 8 >> i;
                tensor(i as u32, &[1, 255, grid, grid], TensorLayout::Nchw)
            })
            .collect();
        let heads = outputs.iter().map(|t| vec![0i8; t.n_elems]).collect();
        Self {
            input: tensor(0, &[1, 64, 64, 3], TensorLayout::Nhwc),
            outputs,
            runs: 0,
            heads,
        }
    }
}

impl InferenceBackend for FakeBackend {
    fn input(&self) -> &TensorInfo {
        &self.input
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn run(&mut self, pixels: &[u8], outputs: &mut [Vec<i8>]) -> Result<()> {
        assert_eq!(pixels.len(), 64 * 64 * 3);
        self.runs += 1;
        for (out, head) in outputs.iter_mut().zip(&self.heads) {
            out.copy_from_slice(head);
        }
        Ok(())
    }
}

/// Sets one confident person box on the stride 8 head at anchor 0, cell
/// (row 2, column 3).
fn person_head(head: &mut [i8]) {
    let grid_len = 8 * 8;
    let cell = 2 * 8 + 3;
    head[cell] = 64; // x offset 0.5
    head[cell + grid_len] = 64; // y offset 0.5
    head[cell + 2 * grid_len] = 64; // width 0.5
    head[cell + 3 * grid_len] = 64; // height 0.5
    head[cell + 4 * grid_len] = 100; // objectness
    head[cell + 5 * grid_len] = 100; // class 0
}

#[test]
fn test_too_few_outputs() {
    let mut session = InferenceSession::with_backend(FakeBackend::new(2), Yolov5Decoder::default())
        .unwrap();
    let pixels = vec![0u8; 64 * 64 * 3];
    for _ in 0..3 {
        let err = session.infer(&pixels).unwrap_err();
        assert!(matches!(
            err,
            Error::OutputCount {
                found: 2,
                required: 3
            }
        ));
        assert_eq!(err.severity(), Severity::Usage);
    }
}

#[test]
fn test_short_input() {
    let mut session = InferenceSession::with_backend(FakeBackend::new(3), Yolov5Decoder::default())
        .unwrap();
    assert!(matches!(
        session.infer(&[0u8; 100]),
        Err(Error::InputSize {
            actual: 100,
            expected: 12288
        })
    ));
}

#[test]
fn test_empty_frame() -> Result<()> {
    let mut session =
        InferenceSession::with_backend(FakeBackend::new(3), Yolov5Decoder::default())?;
    assert_eq!(session.geometry().width, 64);
    let detections = session.infer(&vec![0u8; 64 * 64 * 3 + 16])?;
    assert!(detections.is_empty());
    Ok(())
}

#[test]
fn test_decode_box() -> Result<()> {
    let mut backend = FakeBackend::new(3);
    person_head(&mut backend.heads[0]);
    let mut session = InferenceSession::with_backend(backend, Yolov5Decoder::default())?;

    let detections = session.infer(&vec![0u8; 64 * 64 * 3])?;
    assert_eq!(detections.len(), 1);
    let person = &detections[0];
    assert_eq!(person.class_id, 0);
    assert_eq!(person.label, "person");
    assert!((person.confidence - 0.610_351_56).abs() < 1e-4);
    assert_eq!(
        (person.left, person.top, person.right, person.bottom),
        (23, 13, 33, 26)
    );
    Ok(())
}

#[test]
fn test_decoder_output_count() {
    let geometry = ModelGeometry {
        width: 64,
        height: 64,
        channels: 3,
        layout: TensorLayout::Nhwc,
    };
    let data = vec![0i8; 255 * 64];
    let dims = [1, 255, 8, 8];
    let head = QuantizedTensor {
        data: &data,
        dims: &dims,
        zero_point: 0,
        scale: 1.0 / 128.0,
    };
    assert!(matches!(
        Yolov5Decoder::default().decode(&[head, head], &geometry),
        Err(Error::OutputCount { found: 2, .. })
    ));
}

fn head<'a>(data: &'a [i8], dims: &'a [u32]) -> QuantizedTensor<'a> {
    QuantizedTensor {
        data,
        dims,
        zero_point: 0,
        scale: 1.0 / 128.0,
    }
}

#[test]
fn test_detection_cap() -> Result<()> {
    let geometry = ModelGeometry {
        width: 64,
        height: 64,
        channels: 3,
        layout: TensorLayout::Nhwc,
    };
    let grid_len = 8 * 8;
    let per_anchor = 85;

    // Every anchor of every cell fires with its own class, 192 boxes in all.
    let mut large = vec![0i8; 3 * per_anchor * grid_len];
    for a in 0..3 {
        for cell in 0..grid_len {
            let class = (a * grid_len + cell) % 80;
            large[(a * per_anchor + 4) * grid_len + cell] = 100;
            large[(a * per_anchor + 5 + class) * grid_len + cell] = 100;
        }
    }
    let medium = vec![0i8; 255 * 16];
    let small = vec![0i8; 255 * 4];
    let outputs = [
        head(&large, &[1, 255, 8, 8]),
        head(&medium, &[1, 255, 4, 4]),
        head(&small, &[1, 255, 2, 2]),
    ];

    let detections = Yolov5Decoder::default().decode(&outputs, &geometry)?;
    assert_eq!(detections.len(), MAX_DETECTIONS);
    assert!(detections.iter().all(|d| d.confidence > 0.6));
    Ok(())
}

#[test]
fn test_unterminated_name() {
    let mut attr = rknn_tensor_attr::with_index(1);
    attr.name = [b'x' as c_char; RKNN_MAX_NAME_LEN];
    let info = TensorInfo::from(&attr);
    assert_eq!(info.name, "x".repeat(RKNN_MAX_NAME_LEN));

    attr.name[..6].copy_from_slice(&[b'o', b'u', b't', b'p', b'0', 0].map(|b| b as c_char));
    assert_eq!(TensorInfo::from(&attr).name, "outp0");
}

fn candidate(class_id: usize, score: f32, x1: f32) -> Candidate {
    Candidate {
        class_id,
        score,
        x1,
        y1: 0.0,
        x2: x1 + 10.0,
        y2: 10.0,
    }
}

#[test]
fn test_nms() {
    let a = candidate(0, 0.9, 0.0);
    let b = candidate(0, 0.8, 1.0);
    let c = candidate(1, 0.7, 1.0);
    let d = candidate(0, 0.6, 50.0);
    assert!(iou(&a, &b) > 0.45);
    assert_eq!(iou(&a, &d), 0.0);
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);

    let kept = non_max_suppression(vec![d, b, c, a], 0.45);
    assert_eq!(kept, vec![a, c, d]);
}

#[test]
fn test_detection_json() {
    let det = Detection {
        class_id: 2,
        label: "car".to_string(),
        confidence: 0.5,
        left: 10,
        top: 20,
        right: 110,
        bottom: 70,
    };
    let json = det.to_json();
    assert_eq!(json["class"], "car");
    assert_eq!(json["class_id"], 2);
    assert_eq!(json["score"], 0.5);
    assert_eq!(json["bbox"]["x1"], 10);
    assert_eq!(json["bbox"]["y2"], 70);
    assert_eq!(json["bbox"]["width"], 100);
    assert_eq!(json["bbox"]["height"], 50);
}

#[test]
fn test_missing_model() {
    let err = InferenceSession::open("/nonexistent/model.rknn", Yolov5Decoder::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::Model { .. }));
}

#[test]
#[serial]
#[ignore = "RKNN test is disabled by default (run with --include-ignored to enable)"]
fn test_inference() -> Result<()> {
    let model = std::env::var("RKNN_MODEL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("yolov5s.rknn"));
    let mut session = InferenceSession::open(model, Yolov5Decoder::default())?;
    let geometry = session.geometry();
    let pixels = vec![0x80u8; geometry.input_size()];

    for _ in 0..5 {
        let now = Instant::now();
        let detections = session.infer(&pixels)?;
        println!("{} detections infer: {:?}", detections.len(), now.elapsed());
    }
    session.close();
    Ok(())
}
