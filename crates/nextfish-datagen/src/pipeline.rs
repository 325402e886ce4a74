//! 一連の実行: プロビジョニング → ワーカー → 集約 → マニフェスト

use std::time::{Duration, Instant};

use chrono::Local;

use crate::aggregator::{AggregationOutcome, Aggregator};
use crate::config::DatagenConfig;
use crate::error::Result;
use crate::manifest::{RunManifest, manifest_path_for};
use crate::orchestrator::{self, WorkerJob, WorkerSummary};
use crate::provision::{self, ProvisionedEngine};

/// 1 回の実行結果
#[derive(Debug)]
pub struct PipelineReport {
    pub provisioned: Option<ProvisionedEngine>,
    pub jobs: Vec<WorkerJob>,
    pub outcome: AggregationOutcome,
    pub elapsed: Duration,
}

impl PipelineReport {
    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary::from_jobs(&self.jobs)
    }
}

/// 全フェーズを実行する。
///
/// プロビジョニング失敗・中間ディレクトリ作成失敗・連結書き込み失敗のみ `Err`。
/// ワーカーの失敗や連結対象なしは [`PipelineReport`] に載せて返す。
pub fn run_pipeline(cfg: &DatagenConfig) -> Result<PipelineReport> {
    let started = Instant::now();

    let provisioned = if cfg.provision.enabled {
        Some(provision::provision(&cfg.provision)?)
    } else {
        log::info!("provisioning skipped; using engine {}", cfg.run.engine_path.display());
        None
    };

    let jobs = orchestrator::run_workers(&cfg.run)?;

    let outcome = aggregator_for(cfg).aggregate(Local::now(), Some(&jobs))?;
    if let AggregationOutcome::Merged(result) = &outcome {
        write_manifest(&RunManifest::new(result, &cfg.run, &jobs), &result.final_path);
    }

    let elapsed = started.elapsed();
    log::info!("total time: {:.2} h", elapsed.as_secs_f64() / 3600.0);
    Ok(PipelineReport {
        provisioned,
        jobs,
        outcome,
        elapsed,
    })
}

/// 集約だけをやり直す（前回の中間ファイルが残っている場合）
pub fn merge_only(cfg: &DatagenConfig) -> Result<AggregationOutcome> {
    let outcome = aggregator_for(cfg).aggregate(Local::now(), None)?;
    if let AggregationOutcome::Merged(result) = &outcome {
        write_manifest(&RunManifest::new(result, &cfg.run, &[]), &result.final_path);
    }
    Ok(outcome)
}

fn aggregator_for(cfg: &DatagenConfig) -> Aggregator {
    let agg = Aggregator::new(&cfg.run.output_dir, &cfg.run.final_dir);
    if cfg.provision.enabled && cfg.provision.cleanup {
        agg.with_transient_dir(&cfg.provision.checkout_dir)
    } else {
        agg
    }
}

/// マニフェストの失敗で成果物を無効にはしない
fn write_manifest(manifest: &RunManifest, final_path: &std::path::Path) {
    let path = manifest_path_for(final_path);
    match manifest.write(&path) {
        Ok(()) => log::info!("manifest: {}", path.display()),
        Err(e) => log::warn!("failed to write manifest {}: {e}", path.display()),
    }
}
