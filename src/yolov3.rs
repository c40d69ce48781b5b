//! 推論バックエンドの読み込みと、画像1枚分の検出処理

use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use log::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::detection_result::Detection;
use crate::error::YoloError;
use crate::img_proc::{self, InputTensor};
use crate::postprocess::{self, RawPrediction};

/// 学習済みネットワークを実行するもの
pub trait InferenceBackend {
    /// 正規化済みの入力から各スケールの生の出力を返します。
    fn infer(&self, input: &InputTensor) -> Result<RawPrediction>;

    /// 各出力スケールのチャネル数。分からなければNone
    fn output_channels(&self) -> Option<Vec<usize>> {
        None
    }
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for &B {
    fn infer(&self, input: &InputTensor) -> Result<RawPrediction> {
        (**self).infer(input)
    }

    fn output_channels(&self) -> Option<Vec<usize>> {
        (**self).output_channels()
    }
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
    fn infer(&self, input: &InputTensor) -> Result<RawPrediction> {
        (**self).infer(input)
    }

    fn output_channels(&self) -> Option<Vec<usize>> {
        (**self).output_channels()
    }
}

/// 重みだけのファイルから組み立てるネットワーク構造
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// 3スケールのYOLOv3
    Full { anchors_per_scale: usize, num_classes: usize },
    /// 2スケールのtiny YOLOv3
    Tiny { anchors_per_scale: usize, num_classes: usize },
}

impl Architecture {
    /// アンカー数から構造を決めます。6個ならtiny版です。
    pub fn for_config(config: &DetectorConfig) -> Self {
        let num_anchors = config.anchors.len();
        let num_classes = config.num_classes();
        if num_anchors == 6 {
            Architecture::Tiny { anchors_per_scale: num_anchors / 2, num_classes }
        } else {
            Architecture::Full { anchors_per_scale: num_anchors / 3, num_classes }
        }
    }
}

/// モデルファイルを読み込むもの
pub trait ModelLoader {
    type Backend: InferenceBackend;

    /// 構造と重みを含むモデルを読み込みます。
    ///
    /// 重みだけのファイルなど、この方法で読めない形式の場合は
    /// `YoloError::FormatUnsupported` を返してください。
    fn load_model(&self, path: &Path) -> Result<Self::Backend>;

    /// 構造を組み立ててから重みを読み込みます。
    fn build_with_weights(&self, path: &Path, architecture: Architecture) -> Result<Self::Backend>;
}

fn is_format_unsupported(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<YoloError>(), Some(YoloError::FormatUnsupported(_)))
}

/// モデルを読み込み、設定のアンカー・クラス数と一致するか確認します。
///
/// # Args
/// * `loader` - モデルの読み込み方法
/// * `path` - モデルファイルのパス
/// * `config` - 検出の設定
///
/// # Return
/// * 推論バックエンド
pub fn load_backend<L: ModelLoader>(
    loader: &L,
    path: &Path,
    config: &DetectorConfig,
) -> Result<L::Backend> {
    config.validate()?;

    let backend = match loader.load_model(path) {
        Ok(backend) => {
            info!("{}: full model loaded", path.display());
            check_output_channels(&backend, config)?;
            backend
        }
        Err(e) if is_format_unsupported(&e) => {
            let architecture = Architecture::for_config(config);
            warn!(
                "{}: not a full model, building {:?} and loading weights",
                path.display(),
                architecture
            );
            loader
                .build_with_weights(path, architecture)
                .with_context(|| format!("failed to load weights from {}", path.display()))?
        }
        Err(e) => return Err(e.context(format!("failed to load model {}", path.display()))),
    };
    info!(
        "{} model, {} anchors, and {} classes loaded",
        path.display(),
        config.anchors.len(),
        config.num_classes()
    );
    Ok(backend)
}

fn check_output_channels<B: InferenceBackend>(backend: &B, config: &DetectorConfig) -> Result<()> {
    let Some(channels) = backend.output_channels() else {
        debug!("backend does not report output channels");
        return Ok(());
    };
    if channels.is_empty() || config.anchors.len() % channels.len() != 0 {
        return Err(YoloError::mismatch(format!(
            "{} anchors cannot be split across {} outputs",
            config.anchors.len(),
            channels.len()
        ))
        .into());
    }
    let expected = config.anchors.len() / channels.len() * (config.num_classes() + 5);
    if let Some(&bad) = channels.iter().find(|&&c| c != expected) {
        return Err(YoloError::mismatch(format!(
            "model output has {} channels, anchors and classes need {}",
            bad, expected
        ))
        .into());
    }
    Ok(())
}

/// 画像1枚に対して物体検出を行います。
///
/// # Args
/// * `config` - 検出の設定
/// * `backend` - 推論バックエンド
/// * `img` - 入力画像
///
/// # Return
/// * 元画像の座標系での検出結果
pub fn detect_image<B: InferenceBackend + ?Sized>(
    config: &DetectorConfig,
    backend: &B,
    img: &DynamicImage,
) -> Result<Vec<Detection>> {
    let input_size = img_proc::input_size_for(img, config.model_image_size)?;
    let input = img_proc::letterbox(img, input_size);

    let raw = backend.infer(&input).context("inference failed")?;
    let detections = postprocess::post_process(&raw, config, input.image_size, input_size)?;
    info!("Found {} boxes", detections.len());
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Anchor;
    use std::cell::Cell;
    use std::path::PathBuf;

    #[derive(Debug)]
    struct FixedBackend {
        channels: Option<Vec<usize>>,
    }

    impl InferenceBackend for FixedBackend {
        fn infer(&self, _input: &InputTensor) -> Result<RawPrediction> {
            Ok(vec![])
        }

        fn output_channels(&self) -> Option<Vec<usize>> {
            self.channels.clone()
        }
    }

    /// 読み込みの結果を差し替えられるローダー
    struct StubLoader {
        full: fn(&Path) -> Result<FixedBackend>,
        built: Cell<Option<Architecture>>,
    }

    impl ModelLoader for StubLoader {
        type Backend = FixedBackend;

        fn load_model(&self, path: &Path) -> Result<FixedBackend> {
            (self.full)(path)
        }

        fn build_with_weights(&self, _path: &Path, architecture: Architecture) -> Result<FixedBackend> {
            self.built.set(Some(architecture));
            Ok(FixedBackend { channels: None })
        }
    }

    fn config(num_anchors: usize) -> DetectorConfig {
        DetectorConfig::new(
            vec!["a".into(), "b".into()],
            (0..num_anchors).map(|i| Anchor::new(i as f32 + 1., i as f32 + 1.)).collect(),
        )
    }

    #[test]
    fn full_model_is_used_when_it_loads() {
        let loader = StubLoader {
            full: |_| Ok(FixedBackend { channels: Some(vec![21, 21, 21]) }),
            built: Cell::new(None),
        };
        assert!(load_backend(&loader, Path::new("m.h5"), &config(9)).is_ok());
        assert_eq!(loader.built.get(), None);
    }

    #[test]
    fn unsupported_format_falls_back_to_tiny_weights() {
        let loader = StubLoader {
            full: |p| Err(YoloError::FormatUnsupported(PathBuf::from(p)).into()),
            built: Cell::new(None),
        };
        load_backend(&loader, Path::new("w.h5"), &config(6)).unwrap();
        assert_eq!(
            loader.built.get(),
            Some(Architecture::Tiny { anchors_per_scale: 3, num_classes: 2 })
        );
    }

    #[test]
    fn other_load_errors_do_not_fall_back() {
        let loader = StubLoader {
            full: |_| Err(anyhow::anyhow!("disk on fire")),
            built: Cell::new(None),
        };
        assert!(load_backend(&loader, Path::new("m.h5"), &config(9)).is_err());
        assert_eq!(loader.built.get(), None);
    }

    #[test]
    fn channel_mismatch_is_reported() {
        let loader = StubLoader {
            full: |_| Ok(FixedBackend { channels: Some(vec![255, 255, 255]) }),
            built: Cell::new(None),
        };
        let err = load_backend(&loader, Path::new("m.h5"), &config(9)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<YoloError>(),
            Some(YoloError::ModelMismatch(_))
        ));
    }

    #[test]
    fn empty_prediction_yields_no_detections() {
        let img = DynamicImage::new_rgb8(100, 80);
        let backend = FixedBackend { channels: None };
        let out = detect_image(&config(9), &backend, &img).unwrap();
        assert!(out.is_empty());
    }
}
