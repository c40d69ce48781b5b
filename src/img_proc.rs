//! YOLOに関する画像処理モジュール

use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use log::debug;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rusttype::{Font, Scale};

use crate::detection_result::Detection;
use crate::error::{Result, YoloError};

/// 余白を埋める色
const PAD_COLOR: Rgb<u8> = Rgb([128, 128, 128]);

/// クラス色をシャッフルするときのシード
const COLOR_SEED: u64 = 10101;

/// ネットワークへの入力 (1, H, W, 3)、値は [0, 1]
#[derive(Debug, Clone)]
pub struct InputTensor {
    /// 入力の幅
    pub width: u32,
    /// 入力の高さ
    pub height: u32,
    /// 元画像の (幅, 高さ)
    pub image_size: (u32, u32),
    /// NHWCで並んだ画素値
    pub data: Vec<f32>,
}

impl InputTensor {
    /// テンソルの形状 (N, H, W, C)
    pub fn shape(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, 3]
    }
}

/// ネットワーク入力の大きさを決めます。
///
/// # Args
/// * `img` - 入力画像
/// * `model_image_size` - 固定の入力サイズ。Noneなら画像の大きさを32の倍数に切り下げる
///
/// # Return
/// * 入力の (幅, 高さ)
pub fn input_size_for(img: &DynamicImage, model_image_size: Option<(u32, u32)>) -> Result<(u32, u32)> {
    let size = match model_image_size {
        Some(size) => size,
        None => (img.width() - img.width() % 32, img.height() - img.height() % 32),
    };
    if size.0 == 0 || size.1 == 0 || size.0 % 32 != 0 || size.1 % 32 != 0 {
        return Err(YoloError::config(format!(
            "input size must be a non-zero multiple of 32, got {}x{}",
            size.0, size.1
        )));
    }
    Ok(size)
}

/// 縦横比を保ったまま縮小し、灰色の余白で指定サイズに整形します。
///
/// # Args
/// * `img` - 入力画像
/// * `size` - 整形後の (幅, 高さ)
///
/// # Return
/// * 余白付きのRGB画像
pub fn letterbox_img(img: &DynamicImage, size: (u32, u32)) -> RgbImage {
    let (w, h) = size;
    let (iw, ih) = (img.width(), img.height());
    let scale = f32::min(w as f32 / iw as f32, h as f32 / ih as f32);
    let nw = ((iw as f32 * scale) as u32).clamp(1, w);
    let nh = ((ih as f32 * scale) as u32).clamp(1, h);

    let resized = img.resize_exact(nw, nh, FilterType::CatmullRom).to_rgb8();

    let mut new_img = RgbImage::from_pixel(w, h, PAD_COLOR);
    imageops::replace(&mut new_img, &resized, ((w - nw) / 2).into(), ((h - nh) / 2).into());
    new_img
}

/// 画像をレターボックス化し、ネットワーク入力のテンソルを生成します。
///
/// # Args
/// * `img` - 入力画像
/// * `size` - ネットワーク入力の (幅, 高さ)
///
/// # Return
/// * [0, 1] に正規化した入力テンソル
pub fn letterbox(img: &DynamicImage, size: (u32, u32)) -> InputTensor {
    let boxed = letterbox_img(img, size);
    let data = boxed.as_raw().iter().map(|&v| f32::from(v) / 255.).collect();
    debug!(
        "letterbox {}x{} -> {}x{}",
        img.width(),
        img.height(),
        size.0,
        size.1
    );
    InputTensor {
        width: size.0,
        height: size.1,
        image_size: (img.width(), img.height()),
        data,
    }
}

/// クラスごとの表示色を生成します。
///
/// 色相を等間隔に取ってから固定シードでシャッフルするので、
/// 同じクラス数なら常に同じ色になります。
pub fn class_colors(cls_num: usize) -> Vec<Rgb<u8>> {
    let mut colors: Vec<Rgb<u8>> = (0..cls_num)
        .map(|i| {
            let hsv = color_space::Hsv::new(360. * i as f64 / cls_num as f64, 1., 1.);
            let rgb = color_space::Rgb::from(hsv);
            Rgb([rgb.r as u8, rgb.g as u8, rgb.b as u8])
        })
        .collect();
    let mut rng = StdRng::seed_from_u64(COLOR_SEED);
    colors.shuffle(&mut rng);
    colors
}

/// クラス番号から表示色を返します。
pub fn class_color(class_index: usize, cls_num: usize) -> Rgb<u8> {
    class_colors(cls_num)
        .get(class_index)
        .copied()
        .unwrap_or(Rgb([255, 255, 255]))
}

/// ラベルの上端。ボックスの上に収まらなければ内側に置く
fn label_top(top: i32, text_h: i32) -> i32 {
    if top - text_h >= 0 {
        top - text_h
    } else {
        top + 1
    }
}

/// 画像上にラベルを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `left`, `top` - ボックスの左上の座標
/// * `bg_color` - ラベルの背景色
/// * `font` - ラベルのフォント
/// * `font_size` - ラベルのフォントサイズ
/// * `text` - ラベルに表示するテキスト
fn draw_label(
    img: &mut RgbImage,
    left: i32,
    top: i32,
    bg_color: Rgb<u8>,
    font: &Font,
    font_size: f32,
    text: &str,
) {
    let scale = Scale::uniform(font_size);
    let (text_w, text_h) = text_size(scale, font, text);
    let (text_w, text_h) = (text_w.max(1), text_h.max(font_size as i32).max(1));
    let label_y = label_top(top, text_h);

    let rect = Rect::at(left, label_y).of_size(text_w as u32, text_h as u32);
    draw_filled_rect_mut(img, rect, bg_color);
    draw_text_mut(img, Rgb([0u8, 0, 0]), left, label_y, scale, font, text);
}

/// 画像上にバウンディングボックスとラベルを描画します。
///
/// # Args
///
/// * `img` - 描画する画像 (in-place)
/// * `d_result` - 検出結果の配列
/// * `class_names` - クラス名
/// * `font` - ラベルのフォント。Noneならボックスだけ描く
/// * `line_thickness` - 線の太さ。Noneなら画像の大きさから決める
pub fn draw_bbox(
    img: &mut RgbImage,
    d_result: &[Detection],
    class_names: &[String],
    font: Option<&Font>,
    line_thickness: Option<u32>,
) {
    let (width, height) = img.dimensions();
    let thickness = line_thickness.unwrap_or((width + height) / 300).max(1);
    let font_size = (3e-2 * height as f32 + 0.5).floor().max(1.);
    let colors = class_colors(class_names.len());

    for d in d_result.iter().rev() {
        let color = colors
            .get(d.class_index)
            .copied()
            .unwrap_or(Rgb([255, 255, 255]));
        let r = d.bbox.to_pixel_rect(width, height);
        let (left, top, right, bottom) = (r.left as i32, r.top as i32, r.right as i32, r.bottom as i32);

        for i in 0..thickness as i32 {
            // 右端と下端の画素も含める
            let (w, h) = (right - left - 2 * i + 1, bottom - top - 2 * i + 1);
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(img, Rect::at(left + i, top + i).of_size(w as u32, h as u32), color);
        }

        if let (Some(font), Some(name)) = (font, class_names.get(d.class_index)) {
            draw_label(img, left, top, color, font, font_size, name);
        }
    }
}
