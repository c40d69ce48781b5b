//! 物体検出の結果を保持するモジュール

/// 画像座標系のバウンディングボックス (ピクセル単位)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// 上端のy
    pub top: f32,
    /// 左端のx
    pub left: f32,
    /// 下端のy
    pub bottom: f32,
    /// 右端のx
    pub right: f32,
}

impl BoundingBox {
    pub fn new(top: f32, left: f32, bottom: f32, right: f32) -> Self {
        Self { top, left, bottom, right }
    }

    /// 左上 (x1, y1) と右下 (x2, y2) の座標から作成します。
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(y1, x1, y2, x2)
    }

    /// 端点を含むピクセル数で数えた幅
    pub fn width(&self) -> f32 {
        self.right - self.left + 1.
    }

    /// 端点を含むピクセル数で数えた高さ
    pub fn height(&self) -> f32 {
        self.bottom - self.top + 1.
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 座標を最も近い整数に丸め、画像の範囲に収めます。
    ///
    /// # Args
    /// * `width` - 画像の幅
    /// * `height` - 画像の高さ
    ///
    /// # Return
    /// * 描画や評価に使う整数座標のボックス
    pub fn to_pixel_rect(&self, width: u32, height: u32) -> Self {
        let round = |v: f32| (v + 0.5).floor();
        Self {
            top: round(self.top).max(0.),
            left: round(self.left).max(0.),
            bottom: round(self.bottom).min(height as f32),
            right: round(self.right).min(width as f32),
        }
    }
}

/// 2つのボックスのIoUを計算します。
///
/// 座標は両端を含むピクセルとして扱います (幅 = right - left + 1)。
/// 検出のNMSと評価の両方で同じ定義を使います。
///
/// # Args
/// * `a`, `b` - 比較するボックス
///
/// # Return
/// * 0.0 以上 1.0 以下のIoU
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let xa = a.left.max(b.left);
    let ya = a.top.max(b.top);
    let xb = a.right.min(b.right);
    let yb = a.bottom.min(b.bottom);

    let intersection = (xb - xa + 1.).max(0.) * (yb - ya + 1.).max(0.);
    let union = a.area() + b.area() - intersection;
    if union <= 0. {
        return 0.;
    }
    intersection / union
}

/// 1つの検出結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// バウンディングボックス
    pub bbox: BoundingBox,
    /// コンフィデンス (objectness × クラス確率)
    pub score: f32,
    /// クラス
    pub class_index: usize,
}

impl Detection {
    pub fn new(bbox: BoundingBox, score: f32, class_index: usize) -> Self {
        Self { bbox, score, class_index }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn self_overlap_is_one() {
        let b = BoundingBox::from_corners(3., 4., 20., 41.);
        assert!((iou(&b, &b) - 1.).abs() < 1e-6);
    }

    #[test]
    fn disjoint_boxes_do_not_overlap() {
        let a = BoundingBox::from_corners(0., 0., 10., 10.);
        let b = BoundingBox::from_corners(20., 20., 30., 30.);
        assert_eq!(iou(&a, &b), 0.);
        assert_eq!(iou(&b, &a), 0.);
    }

    #[test]
    fn shifted_box_uses_inclusive_pixels() {
        let a = BoundingBox::from_corners(0., 0., 10., 10.);
        let b = BoundingBox::from_corners(1., 1., 11., 11.);
        // 交差 10x10, 各面積 11x11
        let expected = 100. / (121. + 121. - 100.);
        assert!((iou(&a, &b) - expected).abs() < 1e-6);
        assert!(iou(&a, &b) > 0.5);
    }

    #[test]
    fn pixel_rect_rounds_and_clamps() {
        let b = BoundingBox::new(-3.2, 10.4, 99.6, 120.5);
        let r = b.to_pixel_rect(100, 90);
        assert_eq!(r, BoundingBox::new(0., 10., 90., 100.));
    }

    fn arb_box() -> impl Strategy<Value = BoundingBox> {
        (0f32..400., 0f32..400., 1f32..200., 1f32..200.)
            .prop_map(|(x, y, w, h)| BoundingBox::from_corners(x, y, x + w, y + h))
    }

    proptest! {
        #[test]
        fn iou_is_symmetric(a in arb_box(), b in arb_box()) {
            prop_assert!((iou(&a, &b) - iou(&b, &a)).abs() < 1e-6);
        }

        #[test]
        fn iou_is_bounded(a in arb_box(), b in arb_box()) {
            let v = iou(&a, &b);
            prop_assert!(v >= 0. && v <= 1. + 1e-6);
        }

        #[test]
        fn iou_with_itself_is_one(a in arb_box()) {
            prop_assert!((iou(&a, &a) - 1.).abs() < 1e-5);
        }
    }
}
