//! nextfish 自己対局データ生成パイプライン
//!
//! 設定の確定 → （エンジンの取得・ビルド）→ コアごとにエンジンの `datagen` を
//! 並列起動 → 全員の終了を待つ → 出力を 1 ファイルに連結、の順に進む。
//! 生成データ（`.binpack`）の中身は解釈しない。

pub mod aggregator;
pub mod book;
pub mod config;
pub mod error;
pub mod invoker;
pub mod manifest;
pub mod orchestrator;
pub mod pipeline;
pub mod provision;
pub mod system;

pub use aggregator::{AggregationOutcome, AggregationResult, Aggregator};
pub use config::{CliOverrides, DatagenConfig, FileConfig, RunConfig, RunSection};
pub use error::{DatagenError, Result};
pub use orchestrator::{JobStatus, WorkerJob};
pub use pipeline::{PipelineReport, merge_only, run_pipeline};
