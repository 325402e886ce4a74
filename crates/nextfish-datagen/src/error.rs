//! パイプライン全体のエラー型
//!
//! ワーカーの失敗と「マージ対象なし」はエラーではなくデータとして扱う
//! （[`crate::orchestrator::JobStatus::Failed`] と
//! [`crate::aggregator::AggregationOutcome::NothingToMerge`]）。

use std::path::PathBuf;

/// Errors surfaced by the datagen pipeline
#[derive(thiserror::Error, Debug)]
pub enum DatagenError {
    /// 設定値が不正、または設定ファイルが読めない
    #[error("invalid configuration: {0}")]
    Config(String),

    /// プロビジョニング（clone / download / compile）の失敗。実行全体を中止する
    #[error("provisioning step '{step}' failed: {reason}")]
    Provisioning { step: String, reason: String },

    /// 外部プロセスを起動できなかった
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// 中間出力ディレクトリを用意できなかった
    #[error("failed to prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 前回の実行のワーカー出力が残っている。追記で混ざるので起動しない
    #[error(
        "{} already holds {count} worker output file(s) from a previous run; \
         merge them with `nextfish-datagen merge` or remove them first",
        dir.display()
    )]
    LeftoverOutputs { dir: PathBuf, count: usize },

    /// マージ中の読み書き失敗。中間ファイルは残る
    #[error("failed to write merged artifact {}: {source}", path.display())]
    AggregationWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for datagen operations
pub type Result<T> = std::result::Result<T, DatagenError>;
