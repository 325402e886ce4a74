//! 最終成果物に添える実行マニフェスト（JSON）

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::aggregator::AggregationResult;
use crate::config::RunConfig;
use crate::error::Result;
use crate::orchestrator::{JobStatus, WorkerJob};

#[derive(Serialize)]
pub struct RunManifest {
    #[serde(rename = "type")]
    kind: &'static str,
    timestamp: String,
    output: String,
    output_bytes: u64,
    output_sha256: String,
    settings: ManifestSettings,
    contributing: Vec<ContributingEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    workers: Vec<WorkerEntry>,
}

#[derive(Serialize)]
struct ManifestSettings {
    workers: usize,
    nodes: u64,
    games: u64,
    book: String,
    engine: String,
}

#[derive(Serialize)]
struct ContributingEntry {
    path: String,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<JobStatus>,
    possibly_truncated: bool,
}

#[derive(Serialize)]
struct WorkerEntry {
    index: usize,
    status: JobStatus,
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
}

impl RunManifest {
    pub fn new(result: &AggregationResult, cfg: &RunConfig, jobs: &[WorkerJob]) -> Self {
        Self {
            kind: "nextfish_datagen",
            timestamp: result.started_at.to_rfc3339(),
            output: result.final_path.display().to_string(),
            output_bytes: result.bytes_written,
            output_sha256: result.sha256.clone(),
            settings: ManifestSettings {
                workers: cfg.worker_count,
                nodes: cfg.nodes_per_move,
                games: cfg.games_per_worker,
                book: cfg.book_path.display().to_string(),
                engine: cfg.engine_path.display().to_string(),
            },
            contributing: result
                .contributing_files
                .iter()
                .map(|f| ContributingEntry {
                    path: f.path.display().to_string(),
                    bytes: f.bytes,
                    worker: f.worker_index,
                    status: f.status,
                    possibly_truncated: f.possibly_truncated(),
                })
                .collect(),
            workers: jobs
                .iter()
                .map(|j| WorkerEntry {
                    index: j.index,
                    status: j.status,
                    exit_code: j.exit_code,
                    elapsed_ms: j.elapsed.map(|d| d.as_millis() as u64),
                    failure: j.failure.clone(),
                })
                .collect(),
        }
    }

    /// 一時ファイルに書いてから rename する
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = {
            let ext = path.extension().and_then(OsStr::to_str).unwrap_or("tmp");
            path.with_extension(format!("{}.tmp.{}", ext, std::process::id()))
        };
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// `nextfish_data_X.binpack` → `nextfish_data_X.manifest.json`
pub fn manifest_path_for(final_path: &Path) -> PathBuf {
    final_path.with_extension("manifest.json")
}
