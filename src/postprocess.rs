//! YOLO (You Only Look Once) 物体検出アルゴリズムの出力を後処理するためのモジュール

use log::debug;

use crate::config::{Anchor, DetectorConfig};
use crate::detection_result::{BoundingBox, Detection};
use crate::error::{Result, YoloError};
use crate::nms::nms_process;

/// 1つの出力スケールの生の出力 (NHWC, バッチ1)
#[derive(Debug, Clone)]
pub struct FeatureMap {
    /// グリッドの高さ
    pub grid_h: usize,
    /// グリッドの幅
    pub grid_w: usize,
    /// チャネル数 (アンカー数 × (4 + 1 + クラス数))
    pub channels: usize,
    /// `grid_h * grid_w * channels` 個のロジット
    pub data: Vec<f32>,
}

impl FeatureMap {
    pub fn new(grid_h: usize, grid_w: usize, channels: usize, data: Vec<f32>) -> Self {
        Self { grid_h, grid_w, channels, data }
    }

    /// セル (row, col) のチャネル列
    fn cell(&self, row: usize, col: usize) -> &[f32] {
        let base = (row * self.grid_w + col) * self.channels;
        &self.data[base..base + self.channels]
    }
}

/// 推論1回分の生の出力。粗いスケールから順に並びます。
pub type RawPrediction = Vec<FeatureMap>;

/// デコード済みのボックス
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBox {
    pub bbox: BoundingBox,
    pub objectness: f32,
    pub class_probs: Box<[f32]>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 出力スケールごとに使うアンカーの番号を返します。
///
/// # Args
/// * `num_layers` - 出力スケールの数
/// * `num_anchors` - アンカーの総数
///
/// # Return
/// * スケールごとのアンカー番号
pub fn anchor_mask(num_layers: usize, num_anchors: usize) -> Result<Vec<Vec<usize>>> {
    let mask = match (num_layers, num_anchors) {
        (3, 9) => vec![vec![6, 7, 8], vec![3, 4, 5], vec![0, 1, 2]],
        // tiny版はこの並び
        (2, 6) => vec![vec![3, 4, 5], vec![1, 2, 3]],
        (0, _) => vec![],
        (l, n) if n % l == 0 && n > 0 => {
            let per = n / l;
            (0..l).map(|i| ((l - 1 - i) * per..(l - i) * per).collect()).collect()
        }
        (l, n) => {
            return Err(YoloError::mismatch(format!(
                "{} anchors cannot be split across {} output layers",
                n, l
            )))
        }
    };
    Ok(mask)
}

/// 出力の形状がアンカー数とクラス数に一致するか確認します。
fn check_shapes(
    outputs: &[FeatureMap],
    mask: &[Vec<usize>],
    cls_num: usize,
) -> Result<()> {
    for (l, (fm, m)) in outputs.iter().zip(mask).enumerate() {
        let expected = m.len() * (5 + cls_num);
        if fm.channels != expected {
            return Err(YoloError::mismatch(format!(
                "output {} has {} channels, expected {} ({} anchors x ({} classes + 5))",
                l,
                fm.channels,
                expected,
                m.len(),
                cls_num
            )));
        }
        if fm.data.len() != fm.grid_h * fm.grid_w * fm.channels {
            return Err(YoloError::mismatch(format!(
                "output {} holds {} values, shape {}x{}x{} needs {}",
                l,
                fm.data.len(),
                fm.grid_h,
                fm.grid_w,
                fm.channels,
                fm.grid_h * fm.grid_w * fm.channels
            )));
        }
    }
    Ok(())
}

/// レターボックスの余白を考慮して、正規化座標を元画像のピクセル座標に戻すための係数
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    offset: (f32, f32),
    factor: (f32, f32),
    image: (f32, f32),
}

impl Letterbox {
    fn new(image_size: (u32, u32), input_size: (u32, u32)) -> Self {
        let (iw, ih) = (image_size.0 as f32, image_size.1 as f32);
        let (nw_in, nh_in) = (input_size.0 as f32, input_size.1 as f32);
        let ratio = f32::min(nw_in / iw, nh_in / ih);
        // 前処理と同じく縮小後の辺は最低1px
        let nw = (iw * ratio).round().max(1.);
        let nh = (ih * ratio).round().max(1.);

        Self {
            offset: ((nw_in - nw) / 2. / nw_in, (nh_in - nh) / 2. / nh_in),
            factor: (nw_in / nw, nh_in / nh),
            image: (iw, ih),
        }
    }

    /// 正規化された中心・サイズから元画像上のボックスを求めます。
    fn reverse(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
        let cx = (cx - self.offset.0) * self.factor.0;
        let cy = (cy - self.offset.1) * self.factor.1;
        let w = w * self.factor.0;
        let h = h * self.factor.1;

        BoundingBox {
            top: (cy - h / 2.) * self.image.1,
            left: (cx - w / 2.) * self.image.0,
            bottom: (cy + h / 2.) * self.image.1,
            right: (cx + w / 2.) * self.image.0,
        }
    }
}

/// YOLOの生の出力をボックスにデコードします。
///
/// # Args
/// * `outputs` - 各スケールの出力
/// * `anchors` - アンカーボックス (ネットワーク入力のピクセル単位)
/// * `cls_num` - クラスの数
/// * `image_size` - 元画像の (幅, 高さ)
/// * `input_size` - ネットワーク入力の (幅, 高さ)
///
/// # Return
/// * スケール、行、列、アンカーの順に並んだデコード結果
pub fn decode(
    outputs: &[FeatureMap],
    anchors: &[Anchor],
    cls_num: usize,
    image_size: (u32, u32),
    input_size: (u32, u32),
) -> Result<Vec<DecodedBox>> {
    if outputs.is_empty() {
        return Ok(vec![]);
    }
    let mask = anchor_mask(outputs.len(), anchors.len())?;
    if let Some(&bad) = mask.iter().flatten().find(|&&i| i >= anchors.len()) {
        return Err(YoloError::mismatch(format!(
            "anchor index {} out of range for {} anchors",
            bad,
            anchors.len()
        )));
    }
    check_shapes(outputs, &mask, cls_num)?;
    if image_size.0 == 0 || image_size.1 == 0 {
        return Ok(vec![]);
    }

    let lb = Letterbox::new(image_size, input_size);
    let (in_w, in_h) = (input_size.0 as f32, input_size.1 as f32);
    let stride = 5 + cls_num;

    let mut decoded = vec![];
    for (fm, m) in outputs.iter().zip(&mask) {
        for row in 0..fm.grid_h {
            for col in 0..fm.grid_w {
                let cell = fm.cell(row, col);
                for (a, raw) in m.iter().zip(cell.chunks_exact(stride)) {
                    let anchor = anchors[*a];
                    let cx = (col as f32 + sigmoid(raw[0])) / fm.grid_w as f32;
                    let cy = (row as f32 + sigmoid(raw[1])) / fm.grid_h as f32;
                    let w = anchor.width * raw[2].exp() / in_w;
                    let h = anchor.height * raw[3].exp() / in_h;

                    decoded.push(DecodedBox {
                        bbox: lb.reverse(cx, cy, w, h),
                        objectness: sigmoid(raw[4]),
                        class_probs: raw[5..].iter().map(|&v| sigmoid(v)).collect(),
                    });
                }
            }
        }
    }
    debug!("decoded {} boxes from {} outputs", decoded.len(), outputs.len());
    Ok(decoded)
}

/// 最大のクラス確率とその番号を返します。同値の場合は小さい番号を選びます。
fn get_cls_id(class_probs: &[f32]) -> Option<(usize, f32)> {
    class_probs
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ if p.is_nan() => best,
            _ => Some((i, p)),
        })
}

/// コンフィデンスが閾値未満のボックスを取り除きます。
///
/// # Args
/// * `decoded` - デコード結果
/// * `score_threshold` - コンフィデンスの閾値
///
/// # Return
/// * objectness × クラス確率 が閾値以上の検出結果
pub fn filter_detections(decoded: &[DecodedBox], score_threshold: f32) -> Vec<Detection> {
    decoded
        .iter()
        .filter_map(|d| {
            let (class_index, prob) = get_cls_id(&d.class_probs)?;
            let score = d.objectness * prob;
            (score >= score_threshold).then(|| Detection::new(d.bbox, score, class_index))
        })
        .collect()
}

/// YOLOの出力から物体検出を行います。
///
/// # Args
/// * `outputs` - 各スケールの出力
/// * `config` - 検出の設定
/// * `image_size` - 元画像の (幅, 高さ)
/// * `input_size` - ネットワーク入力の (幅, 高さ)
///
/// # Return
/// * NMS後の検出結果
pub fn post_process(
    outputs: &[FeatureMap],
    config: &DetectorConfig,
    image_size: (u32, u32),
    input_size: (u32, u32),
) -> Result<Vec<Detection>> {
    let decoded = decode(
        outputs,
        &config.anchors,
        config.class_names.len(),
        image_size,
        input_size,
    )?;
    let candidates = filter_detections(&decoded, config.score_threshold);
    debug!("{} candidates over score {}", candidates.len(), config.score_threshold);

    Ok(nms_process(&candidates, config.iou_threshold, config.max_boxes))
}
