//! 検出の設定と、クラスファイル・アンカーファイルの読み込み

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{Result, YoloError};

pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.3;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MAX_BOXES: usize = 20;
pub const DEFAULT_MODEL_IMAGE_SIZE: (u32, u32) = (416, 416);

/// アンカーボックス (ネットワーク入力のピクセル単位)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub width: f32,
    pub height: f32,
}

impl Anchor {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// 検出パイプラインの設定
///
/// 一度作ったら変更せず、推論ごとに参照で渡します。
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// クラス名 (行番号がクラス番号)
    pub class_names: Vec<String>,
    /// アンカーボックス
    pub anchors: Vec<Anchor>,
    /// コンフィデンスの閾値
    pub score_threshold: f32,
    /// NMSのIoU閾値
    pub iou_threshold: f32,
    /// 1クラスあたりの最大検出数
    pub max_boxes: Option<usize>,
    /// ネットワーク入力の (幅, 高さ)。Noneなら画像から決める
    pub model_image_size: Option<(u32, u32)>,
    /// 評価で正解とみなすIoUの閾値
    pub match_threshold: f32,
}

impl DetectorConfig {
    /// 既定の閾値で設定を作成します。
    pub fn new(class_names: Vec<String>, anchors: Vec<Anchor>) -> Self {
        Self {
            class_names,
            anchors,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_boxes: Some(DEFAULT_MAX_BOXES),
            model_image_size: Some(DEFAULT_MODEL_IMAGE_SIZE),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    /// クラスファイルとアンカーファイルから設定を作成します。
    ///
    /// # Args
    /// * `classes_path` - クラス名を1行に1つ書いたファイル
    /// * `anchors_path` - アンカーをカンマ区切りで1行に書いたファイル
    ///
    /// # Return
    /// * 既定の閾値を持つ設定
    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(
        classes_path: P,
        anchors_path: Q,
    ) -> Result<Self> {
        let class_names = load_class_names(classes_path)?;
        let anchors = load_anchors(anchors_path)?;
        info!("{} classes and {} anchors loaded", class_names.len(), anchors.len());
        let config = Self::new(class_names, anchors);
        config.validate()?;
        Ok(config)
    }

    pub fn with_thresholds(mut self, score_threshold: f32, iou_threshold: f32) -> Self {
        self.score_threshold = score_threshold;
        self.iou_threshold = iou_threshold;
        self
    }

    pub fn with_max_boxes(mut self, max_boxes: Option<usize>) -> Self {
        self.max_boxes = max_boxes;
        self
    }

    pub fn with_model_image_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.model_image_size = size;
        self
    }

    pub fn with_match_threshold(mut self, match_threshold: f32) -> Self {
        self.match_threshold = match_threshold;
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 設定値が推論に使えるか確認します。
    pub fn validate(&self) -> Result<()> {
        if self.class_names.is_empty() {
            return Err(YoloError::config("class list is empty"));
        }
        if self.anchors.is_empty() {
            return Err(YoloError::config("anchor list is empty"));
        }
        let thresholds = [
            ("score_threshold", self.score_threshold),
            ("iou_threshold", self.iou_threshold),
            ("match_threshold", self.match_threshold),
        ];
        for (name, v) in thresholds {
            if !(0.0..=1.0).contains(&v) {
                return Err(YoloError::config(format!("{} must be in [0, 1], got {}", name, v)));
            }
        }
        if let Some((w, h)) = self.model_image_size {
            if w == 0 || h == 0 || w % 32 != 0 || h % 32 != 0 {
                return Err(YoloError::config(format!(
                    "model image size must be a non-zero multiple of 32, got {}x{}",
                    w, h
                )));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        YoloError::config(format!("cannot read {}: {}", path.display(), e))
    })
}

/// クラス名を読み込みます。空行は無視します。
pub fn load_class_names<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let names: Vec<String> = read_config_file(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if names.is_empty() {
        return Err(YoloError::config(format!("no class names in {}", path.display())));
    }
    debug!("classes: {:?}", names);
    Ok(names)
}

/// アンカーファイルの1行目を (幅, 高さ) の組として読み込みます。
pub fn load_anchors<P: AsRef<Path>>(path: P) -> Result<Vec<Anchor>> {
    let path = path.as_ref();
    let text = read_config_file(path)?;
    let line = text.lines().next().unwrap_or("");
    parse_anchors(line)
        .map_err(|msg| YoloError::config(format!("{}: {}", path.display(), msg)))
}

fn parse_anchors(line: &str) -> std::result::Result<Vec<Anchor>, String> {
    let values = line
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<f32>().map_err(|_| format!("invalid anchor value {:?}", v)))
        .collect::<std::result::Result<Vec<f32>, String>>()?;

    if values.is_empty() {
        return Err("no anchors".to_string());
    }
    if values.len() % 2 != 0 {
        return Err(format!("odd number of anchor values ({})", values.len()));
    }
    Ok(values
        .chunks_exact(2)
        .map(|p| Anchor::new(p[0], p[1]))
        .collect())
}
