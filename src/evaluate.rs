//! 検証データに対する検出精度 (precision) の評価

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use rayon::prelude::*;

use crate::config::DetectorConfig;
use crate::detection_result::{iou, BoundingBox, Detection};
use crate::error::YoloError;
use crate::yolov3::{detect_image, InferenceBackend};

/// 正解のボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruthAnnotation {
    pub bbox: BoundingBox,
    pub class_index: usize,
}

/// 検証データの1行 (画像1枚分)
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSample {
    pub image_path: PathBuf,
    pub annotations: Vec<GroundTruthAnnotation>,
}

/// 画像1枚分の検出結果
#[derive(Debug, Clone)]
pub struct ImageResult {
    /// 元画像の (幅, 高さ)
    pub image_size: (u32, u32),
    pub detections: Vec<Detection>,
}

fn parse_box(field: &str, line_no: usize) -> crate::error::Result<GroundTruthAnnotation> {
    let values: Vec<&str> = field.split(',').collect();
    if values.len() != 5 {
        return Err(YoloError::parse(
            line_no,
            format!("box {:?} has {} fields, expected x1,y1,x2,y2,class", field, values.len()),
        ));
    }
    let mut coords = [0f32; 4];
    for (c, v) in coords.iter_mut().zip(&values[..4]) {
        *c = v
            .parse::<i32>()
            .map_err(|_| YoloError::parse(line_no, format!("invalid coordinate {:?} in {:?}", v, field)))?
            as f32;
    }
    let class_index = values[4]
        .parse::<usize>()
        .map_err(|_| YoloError::parse(line_no, format!("invalid class {:?} in {:?}", values[4], field)))?;

    Ok(GroundTruthAnnotation {
        bbox: BoundingBox::from_corners(coords[0], coords[1], coords[2], coords[3]),
        class_index,
    })
}

/// 検証データの1行を解釈します。
///
/// 形式は `<画像パス> x1,y1,x2,y2,class x1,y1,x2,y2,class ...` です。
///
/// # Args
/// * `line` - 行の文字列
/// * `line_no` - エラー表示用の行番号 (1始まり)
pub fn parse_validation_line(line: &str, line_no: usize) -> crate::error::Result<ValidationSample> {
    let mut fields = line.split_whitespace();
    let image_path = fields
        .next()
        .ok_or_else(|| YoloError::parse(line_no, "missing image path"))?;
    let annotations = fields
        .map(|f| parse_box(f, line_no))
        .collect::<crate::error::Result<Vec<_>>>()?;

    Ok(ValidationSample {
        image_path: PathBuf::from(image_path),
        annotations,
    })
}

/// 検証データ全体を解釈します。空行は読み飛ばします。
///
/// # Args
/// * `text` - 検証データ
/// * `num_classes` - クラス数。指定するとクラス番号の範囲も確認する
pub fn parse_validation(text: &str, num_classes: Option<usize>) -> crate::error::Result<Vec<ValidationSample>> {
    let mut samples = vec![];
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sample = parse_validation_line(line, i + 1)?;
        if let Some(n) = num_classes {
            if let Some(a) = sample.annotations.iter().find(|a| a.class_index >= n) {
                return Err(YoloError::parse(
                    i + 1,
                    format!("class {} is out of range for {} classes", a.class_index, n),
                ));
            }
        }
        samples.push(sample);
    }
    Ok(samples)
}

/// 検証データのファイルを読み込みます。
pub fn load_validation_file<P: AsRef<Path>>(
    path: P,
    num_classes: Option<usize>,
) -> crate::error::Result<Vec<ValidationSample>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| YoloError::io(path, e))?;
    let samples = parse_validation(&text, num_classes)?;
    debug!("{}: {} samples", path.display(), samples.len());
    Ok(samples)
}

/// クラスごとの照合結果の集計
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchRecord {
    /// 正解と一致した検出のIoU
    ious: BTreeMap<usize, Vec<f32>>,
    /// 検出数
    detections: BTreeMap<usize, usize>,
    /// 正解の物体数
    objects: BTreeMap<usize, usize>,
}

impl MatchRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// 画像1枚分の検出結果を正解と照合して記録します。
    ///
    /// 検出ボックスは整数座標に丸めて画像内に収めてから比較します。
    ///
    /// # Args
    /// * `annotations` - 正解
    /// * `result` - 検出結果
    /// * `match_threshold` - これを超えるIoUを正解とみなす
    pub fn record_image(
        &mut self,
        annotations: &[GroundTruthAnnotation],
        result: &ImageResult,
        match_threshold: f32,
    ) {
        let (w, h) = result.image_size;
        let rects: Vec<(usize, BoundingBox)> = result
            .detections
            .iter()
            .map(|d| (d.class_index, d.bbox.to_pixel_rect(w, h)))
            .collect();

        for &(class_index, _) in &rects {
            *self.detections.entry(class_index).or_default() += 1;
        }

        for gt in annotations {
            *self.objects.entry(gt.class_index).or_default() += 1;
            for (_, rect) in rects.iter().filter(|(c, _)| *c == gt.class_index) {
                let v = iou(&gt.bbox, rect);
                if v > match_threshold {
                    self.ious.entry(gt.class_index).or_default().push(v);
                }
            }
        }
    }

    /// 別の集計を合算します。
    pub fn merge(mut self, other: MatchRecord) -> Self {
        for (c, v) in other.ious {
            self.ious.entry(c).or_default().extend(v);
        }
        for (c, n) in other.detections {
            *self.detections.entry(c).or_default() += n;
        }
        for (c, n) in other.objects {
            *self.objects.entry(c).or_default() += n;
        }
        self
    }

    /// クラスごとのprecisionを計算します。
    ///
    /// 検証データ全体でTP = 一致数、FP = max(0, 検出数 - TP) とします。
    pub fn report(&self) -> EvaluationReport {
        let mut classes: Vec<usize> = self
            .ious
            .keys()
            .chain(self.detections.keys())
            .chain(self.objects.keys())
            .copied()
            .collect();
        classes.sort_unstable();
        classes.dedup();

        let classes = classes
            .into_iter()
            .map(|class_index| {
                let ious = self.ious.get(&class_index).map(Vec::as_slice).unwrap_or(&[]);
                let detections = self.detections.get(&class_index).copied().unwrap_or(0);
                let true_positives = ious.len();
                let false_positives = detections.saturating_sub(true_positives);
                let denom = true_positives + false_positives;

                ClassReport {
                    class_index,
                    true_positives,
                    false_positives,
                    ground_truth: self.objects.get(&class_index).copied().unwrap_or(0),
                    precision: (denom > 0).then(|| true_positives as f32 / denom as f32),
                    mean_iou: (!ious.is_empty())
                        .then(|| ious.iter().sum::<f32>() / ious.len() as f32),
                }
            })
            .collect();
        EvaluationReport { classes }
    }
}

/// 1クラス分の評価結果
#[derive(Debug, Clone, PartialEq)]
pub struct ClassReport {
    pub class_index: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    /// 正解の物体数
    pub ground_truth: usize,
    /// TP + FP が0の場合はNone
    pub precision: Option<f32>,
    pub mean_iou: Option<f32>,
}

/// 評価結果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationReport {
    /// クラス番号の昇順
    pub classes: Vec<ClassReport>,
}

impl EvaluationReport {
    pub fn class(&self, class_index: usize) -> Option<&ClassReport> {
        self.classes.iter().find(|c| c.class_index == class_index)
    }

    /// クラス名を付けてログに出力します。
    pub fn log(&self, class_names: &[String]) {
        for c in &self.classes {
            let name = class_names.get(c.class_index).map(String::as_str).unwrap_or("?");
            info!(
                "{} ({}): precision {:.3}, tp {}, fp {}, objects {}",
                name,
                c.class_index,
                c.precision.unwrap_or(f32::NAN),
                c.true_positives,
                c.false_positives,
                c.ground_truth
            );
        }
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.classes {
            writeln!(
                f,
                "class {}: precision {:.3} (tp {}, fp {}, objects {})",
                c.class_index,
                c.precision.unwrap_or(f32::NAN),
                c.true_positives,
                c.false_positives,
                c.ground_truth
            )?;
        }
        Ok(())
    }
}

/// 検出関数を使って検証データを評価するもの
#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    /// これを超えるIoUを正解とみなす
    pub match_threshold: f32,
}

impl Evaluator {
    pub fn new(match_threshold: f32) -> Self {
        Self { match_threshold }
    }

    fn tally<F>(&self, sample: &ValidationSample, detect: &F) -> Result<MatchRecord>
    where
        F: Fn(&ValidationSample) -> Result<ImageResult>,
    {
        let result = detect(sample)
            .with_context(|| format!("detection failed for {}", sample.image_path.display()))?;
        let mut record = MatchRecord::new();
        record.record_image(&sample.annotations, &result, self.match_threshold);
        Ok(record)
    }

    /// 画像を1枚ずつ順に評価します。
    pub fn evaluate<F>(&self, samples: &[ValidationSample], detect: F) -> Result<EvaluationReport>
    where
        F: Fn(&ValidationSample) -> Result<ImageResult>,
    {
        let mut record = MatchRecord::new();
        for sample in samples {
            record = record.merge(self.tally(sample, &detect)?);
        }
        Ok(record.report())
    }

    /// 画像ごとの処理を並列に行い、最後に集計を合算します。
    pub fn evaluate_par<F>(&self, samples: &[ValidationSample], detect: F) -> Result<EvaluationReport>
    where
        F: Fn(&ValidationSample) -> Result<ImageResult> + Sync,
    {
        let records = samples
            .par_iter()
            .map(|sample| self.tally(sample, &detect))
            .collect::<Result<Vec<_>>>()?;
        let record = records.into_iter().fold(MatchRecord::new(), MatchRecord::merge);
        Ok(record.report())
    }
}

/// 検証データのファイルに書かれた画像を読み込み、検出と評価を行います。
///
/// # Args
/// * `config` - 検出の設定
/// * `backend` - 推論バックエンド
/// * `validation_path` - 検証データのファイル
///
/// # Return
/// * クラスごとの評価結果
pub fn evaluate_validation_file<B, P>(
    config: &DetectorConfig,
    backend: &B,
    validation_path: P,
) -> Result<EvaluationReport>
where
    B: InferenceBackend + Sync + ?Sized,
    P: AsRef<Path>,
{
    let samples = load_validation_file(validation_path.as_ref(), Some(config.num_classes()))?;
    info!("evaluating {} images", samples.len());

    let evaluator = Evaluator::new(config.match_threshold);
    let report = evaluator.evaluate_par(&samples, |sample| {
        let img = image::open(&sample.image_path)
            .map_err(YoloError::from)
            .with_context(|| format!("cannot open {}", sample.image_path.display()))?;
        Ok(ImageResult {
            image_size: (img.width(), img.height()),
            detections: detect_image(config, backend, &img)?,
        })
    })?;
    report.log(&config.class_names);
    Ok(report)
}
