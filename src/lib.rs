//! # YOLOv3 物体検出の後処理・評価ライブラリ
//!
//! このクレートは、YOLOv3 / tiny YOLOv3 の生の出力から検出結果を得るための
//! 後処理と、検証データに対する評価を行うRustライブラリです。
//! ネットワーク本体の実行は [`yolov3::InferenceBackend`] を実装した外部のものに任せます。
//!
//! ## 主な機能
//!
//! 1. **設定の読み込み**: クラス名とアンカーボックスをファイルから読み込みます。
//! 2. **前処理**: 画像をレターボックス化し、ネットワークの入力テンソルを生成します。
//! 3. **後処理**: アンカーを使って出力をデコードし、閾値処理とクラス別のNMSを行います。
//! 4. **評価**: 検出結果を正解と照合し、クラスごとのprecisionを計算します。
//! 5. **描画**: 検出結果を画像に描画します。
//!
//! ## Example
//! ```no_run
//! # use yolo_v3_detect::{config::DetectorConfig, yolov3::{detect_image, InferenceBackend}};
//! # fn run(backend: &dyn InferenceBackend) -> anyhow::Result<()> {
//! let config = DetectorConfig::from_files("model_data/classes.txt", "model_data/yolo_anchors.txt")?;
//! let img = image::open("test.jpg")?;
//! let result = detect_image(&config, backend, &img)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod detection_result;
pub mod error;
pub mod evaluate;
pub mod img_proc;
pub mod nms;
pub mod postprocess;
pub mod yolov3;

pub use detection_result::{iou, BoundingBox, Detection};
pub use error::YoloError;
