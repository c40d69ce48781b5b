//! クレート全体で使うエラー型

use std::path::PathBuf;

use thiserror::Error;

/// 検出パイプラインのエラー
#[derive(Error, Debug)]
pub enum YoloError {
    /// クラスファイルやアンカーファイル、閾値などの設定の誤り
    #[error("configuration error: {0}")]
    Config(String),

    /// 入力ファイルの行が解釈できない
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// モデルの出力とアンカー・クラス数が一致しない
    #[error("model mismatch: {0}")]
    ModelMismatch(String),

    /// モデルファイルを完全なモデルとして読み込めない
    #[error("unsupported model format: {}", .0.display())]
    FormatUnsupported(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl YoloError {
    pub fn config(msg: impl Into<String>) -> Self {
        YoloError::Config(msg.into())
    }

    pub fn parse(line: usize, msg: impl Into<String>) -> Self {
        YoloError::Parse {
            line,
            message: msg.into(),
        }
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        YoloError::ModelMismatch(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        YoloError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, YoloError>;
