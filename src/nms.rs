use std::collections::BTreeMap;

use log::debug;

use crate::detection_result::{iou, Detection};

/// 1クラス分の候補にNMSを適用します。
///
/// コンフィデンスの降順に安定ソートし、選んだボックスとのIoUが
/// `nms_threshold` を超える候補を取り除きます。
fn nms(bb: &[Detection], nms_threshold: f32, max_boxes: Option<usize>) -> Vec<Detection> {
    let mut sorted_bb = bb.to_vec();
    sorted_bb.sort_by(|a, b| b.score.total_cmp(&a.score));

    let cap = max_boxes.unwrap_or(usize::MAX);
    let mut kept: Vec<Detection> = Vec::with_capacity(sorted_bb.len().min(cap));
    let mut remaining = sorted_bb.into_iter();

    // remaining はソート済みなので、先頭から順に既に選んだボックスと比較すれば
    // 「残りの最大を選んで重なりを消す」手順と同じ結果になる
    while kept.len() < cap {
        let Some(candidate) = remaining.next() else {
            break;
        };
        if kept
            .iter()
            .all(|k| iou(&k.bbox, &candidate.bbox) <= nms_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

/// クラス別にNon-Maximum Suppression (NMS) を適用します。
///
/// # Args
/// * `bb` - 候補の検出結果
/// * `nms_threshold` - 抑制するIoUの閾値
/// * `max_boxes` - 1クラスあたりに残す最大数 (Noneで無制限)
///
/// # Return
/// * クラス番号の昇順、各クラス内はコンフィデンスの降順に並んだ検出結果
pub fn nms_process(
    bb: &[Detection],
    nms_threshold: f32,
    max_boxes: Option<usize>,
) -> Vec<Detection> {
    // クラス別に分割
    let mut cls: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();
    for &detection in bb {
        cls.entry(detection.class_index).or_default().push(detection);
    }

    let new_box: Vec<Detection> = cls
        .values()
        .flat_map(|d| nms(d, nms_threshold, max_boxes))
        .collect();
    debug!("nms: {} candidates -> {} boxes", bb.len(), new_box.len());
    new_box
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection_result::BoundingBox;
    use proptest::prelude::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class_index: usize) -> Detection {
        Detection::new(BoundingBox::from_corners(x1, y1, x2, y2), score, class_index)
    }

    #[test]
    fn keeps_only_the_stronger_of_two_overlapping_boxes() {
        let a = det(0., 0., 10., 10., 0.9, 0);
        let b = det(1., 1., 11., 11., 0.8, 0);
        let out = nms_process(&[b, a], 0.5, None);
        assert_eq!(out, vec![a]);
    }

    #[test]
    fn different_classes_are_suppressed_independently() {
        let a = det(0., 0., 10., 10., 0.9, 0);
        let b = det(0., 0., 10., 10., 0.4, 1);
        let out = nms_process(&[a, b], 0.1, None);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn output_is_grouped_by_class_then_score() {
        let input = [
            det(0., 0., 10., 10., 0.5, 2),
            det(50., 50., 60., 60., 0.7, 0),
            det(100., 100., 110., 110., 0.9, 2),
            det(0., 0., 10., 10., 0.6, 0),
        ];
        let out = nms_process(&input, 0.45, None);
        let order: Vec<(usize, f32)> = out.iter().map(|d| (d.class_index, d.score)).collect();
        assert_eq!(order, vec![(0, 0.7), (0, 0.6), (2, 0.9), (2, 0.5)]);
    }

    #[test]
    fn equal_scores_keep_insertion_order() {
        let first = det(0., 0., 10., 10., 0.5, 0);
        let second = det(1., 1., 11., 11., 0.5, 0);
        assert_eq!(nms_process(&[first, second], 0.5, None), vec![first]);
        assert_eq!(nms_process(&[second, first], 0.5, None), vec![second]);
    }

    #[test]
    fn max_boxes_caps_each_class() {
        let input: Vec<Detection> = (0..5)
            .map(|i| det(i as f32 * 100., 0., i as f32 * 100. + 10., 10., 0.5 + i as f32 * 0.1, 0))
            .chain([det(0., 500., 10., 510., 0.3, 1)])
            .collect();
        let out = nms_process(&input, 0.45, Some(2));
        assert_eq!(out.len(), 3);
        assert!((out[0].score - 0.9).abs() < 1e-6);
        assert!((out[1].score - 0.8).abs() < 1e-6);
        assert_eq!(out[2].class_index, 1);
    }

    #[test]
    fn sparse_class_indices_are_grouped_without_padding() {
        let a = det(0., 0., 10., 10., 0.9, usize::MAX);
        let b = det(1., 1., 11., 11., 0.8, usize::MAX);
        let c = det(0., 0., 10., 10., 0.5, 50_000_000);
        let d = det(0., 0., 10., 10., 0.4, 3);
        let out = nms_process(&[a, b, c, d], 0.5, None);
        assert_eq!(out, vec![d, c, a]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(nms_process(&[], 0.45, Some(20)).is_empty());
    }

    fn arb_detection() -> impl Strategy<Value = Detection> {
        (0f32..200., 0f32..200., 1f32..80., 1f32..80., 0f32..1., 0usize..3)
            .prop_map(|(x, y, w, h, s, c)| det(x, y, x + w, y + h, s, c))
    }

    proptest! {
        #[test]
        fn survivors_do_not_overlap_and_come_from_input(
            input in prop::collection::vec(arb_detection(), 0..40),
            threshold in 0.1f32..0.9,
        ) {
            let out = nms_process(&input, threshold, None);
            for (i, a) in out.iter().enumerate() {
                prop_assert!(input.contains(a));
                for b in &out[i + 1..] {
                    if a.class_index == b.class_index {
                        prop_assert!(iou(&a.bbox, &b.bbox) <= threshold);
                    }
                }
            }
        }
    }
}
