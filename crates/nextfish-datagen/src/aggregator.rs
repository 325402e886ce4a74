//! ワーカー出力の結合
//!
//! 全ワーカーの終了後、`output_dir` に存在する `*.binpack` をワーカー番号順に
//! 連結して `nextfish_data_{YYYYMMDD_HHMMSS}.binpack` を 1 つ作る。
//! 中身は解釈しない（不透明なバイト列として連結するだけ）。
//!
//! 寄与判定はファイルの有無のみ。失敗したワーカーが途中まで書いたファイルも
//! 連結対象になる。ジョブ一覧が渡された場合は各ファイルにジョブ状態を付け、
//! 失敗ジョブのファイルは「途中で切れている可能性あり」として報告する
//! （即死したのか長時間動いた末に落ちたのかはここでは区別できない）。

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{DatagenError, Result};
use crate::orchestrator::{JobStatus, WORKER_FILE_EXT, WORKER_FILE_PREFIX, WorkerJob};

/// 最終成果物ファイル名の接頭辞
pub const FINAL_FILE_PREFIX: &str = "nextfish_data_";

const COPY_BUF_CAP: usize = 64 * 1024;

/// 集約開始時刻から最終成果物のファイル名を作る（秒単位）
pub fn final_artifact_name(at: &DateTime<Local>) -> String {
    format!("{FINAL_FILE_PREFIX}{}.{WORKER_FILE_EXT}", at.format("%Y%m%d_%H%M%S"))
}

/// 連結に使われた 1 ファイル
#[derive(Debug, Clone, Serialize)]
pub struct ContributingFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub worker_index: Option<usize>,
    /// ジョブ一覧が渡されなかった場合は `None`
    pub status: Option<JobStatus>,
}

impl ContributingFile {
    /// 失敗したワーカーの出力（途中で切れている可能性がある）
    pub fn possibly_truncated(&self) -> bool {
        self.status == Some(JobStatus::Failed)
    }
}

/// 連結結果。作成後は変更しない
#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub final_path: PathBuf,
    /// 連結順
    pub contributing_files: Vec<ContributingFile>,
    pub bytes_written: u64,
    pub sha256: String,
    pub started_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub enum AggregationOutcome {
    Merged(AggregationResult),
    /// 連結対象が 1 つもない。何も作らず、何も消さない
    NothingToMerge,
}

/// `core{N}.binpack` なら N を返す
pub fn worker_index_of(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(WORKER_FILE_EXT)?.strip_suffix('.')?;
    let digits = stem.strip_prefix(WORKER_FILE_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// `dir` 内の `*.binpack` を連結順に並べて返す。
///
/// ワーカー番号の昇順（`core2` < `core10`）、番号を持たないファイルはその後ろに
/// 名前順で並ぶ。ディレクトリが存在しなければ空。
pub fn collect_worker_outputs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let is_binpack = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(WORKER_FILE_EXT));
        if is_binpack {
            files.push(path);
        }
    }
    files.sort_by(|a, b| {
        let ka = worker_index_of(a);
        let kb = worker_index_of(b);
        (ka.is_none(), ka, a.file_name()).cmp(&(kb.is_none(), kb, b.file_name()))
    });
    Ok(files)
}

/// 集約処理
#[derive(Debug, Clone)]
pub struct Aggregator {
    output_dir: PathBuf,
    final_dir: PathBuf,
    /// マージ成功後に削除する一時ディレクトリ（ソースの checkout など）
    transient_dirs: Vec<PathBuf>,
}

impl Aggregator {
    pub fn new(output_dir: impl Into<PathBuf>, final_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            final_dir: final_dir.into(),
            transient_dirs: Vec::new(),
        }
    }

    pub fn with_transient_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transient_dirs.push(dir.into());
        self
    }

    /// 連結して後片付けまで行う。
    ///
    /// `started_at` は集約開始時の壁時計時刻で、最終ファイル名に使う。
    /// 書き込みに失敗した場合は作りかけの最終ファイルを消し、中間ファイルは残す。
    pub fn aggregate(
        &self,
        started_at: DateTime<Local>,
        jobs: Option<&[WorkerJob]>,
    ) -> Result<AggregationOutcome> {
        log::info!("--- merging worker outputs from {} ---", self.output_dir.display());
        // 一覧の読み取り失敗も連結の失敗として扱う（中間ファイルは残る）
        let inputs = collect_worker_outputs(&self.output_dir).map_err(|e| match e {
            DatagenError::Io(source) => {
                log::error!("!! cannot list {}: {source}", self.output_dir.display());
                DatagenError::AggregationWrite {
                    path: self.output_dir.clone(),
                    source,
                }
            }
            other => other,
        })?;
        if inputs.is_empty() {
            log::warn!("!! no worker output found in {}; nothing to merge", self.output_dir.display());
            return Ok(AggregationOutcome::NothingToMerge);
        }

        if let Some(jobs) = jobs {
            for job in jobs.iter().filter(|j| j.status == JobStatus::Failed) {
                if inputs.contains(&job.output_path) {
                    log::warn!(
                        "{} failed but left {}; merging it anyway (possibly truncated)",
                        job.label(),
                        job.output_path.display()
                    );
                } else {
                    log::warn!("{} failed and produced no output", job.label());
                }
            }
        }

        let final_path = self.final_dir.join(final_artifact_name(&started_at));
        let (bytes_written, sha256, sizes) =
            write_concatenated(&inputs, &self.final_dir, &final_path).map_err(|source| {
                log::error!(
                    "!! merge failed; intermediate files kept in {}",
                    self.output_dir.display()
                );
                DatagenError::AggregationWrite {
                    path: final_path.clone(),
                    source,
                }
            })?;

        let status_of: HashMap<&Path, JobStatus> = jobs
            .unwrap_or_default()
            .iter()
            .map(|j| (j.output_path.as_path(), j.status))
            .collect();
        let contributing_files = inputs
            .iter()
            .zip(sizes)
            .map(|(path, bytes)| ContributingFile {
                path: path.clone(),
                bytes,
                worker_index: worker_index_of(path),
                status: status_of.get(path.as_path()).copied(),
            })
            .collect::<Vec<_>>();

        log::info!(
            "merged {} file(s), {} bytes -> {}",
            contributing_files.len(),
            bytes_written,
            final_path.display()
        );

        self.cleanup();

        Ok(AggregationOutcome::Merged(AggregationResult {
            final_path,
            contributing_files,
            bytes_written,
            sha256,
            started_at,
        }))
    }

    fn cleanup(&self) {
        for dir in std::iter::once(&self.output_dir).chain(self.transient_dirs.iter()) {
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(dir) {
                Ok(()) => log::info!("removed {}", dir.display()),
                Err(e) => log::warn!("failed to remove {}: {e}", dir.display()),
            }
        }
    }
}

/// `inputs` を順に `final_path` へ書き出す。既存ファイルは上書きしない。
///
/// 戻り値は (総バイト数, SHA-256, 入力ごとのバイト数)。
fn write_concatenated(
    inputs: &[PathBuf],
    final_dir: &Path,
    final_path: &Path,
) -> io::Result<(u64, String, Vec<u64>)> {
    fs::create_dir_all(final_dir)?;
    let file = OpenOptions::new().write(true).create_new(true).open(final_path)?;

    let result = (|| -> io::Result<(u64, String, Vec<u64>)> {
        let mut out = BufWriter::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUF_CAP];
        let mut total = 0u64;
        let mut sizes = Vec::with_capacity(inputs.len());
        for path in inputs {
            let mut f = File::open(path).map_err(|e| with_path(e, path))?;
            let mut size = 0u64;
            loop {
                let n = match f.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(with_path(e, path)),
                };
                out.write_all(&buf[..n])?;
                hasher.update(&buf[..n]);
                size += n as u64;
            }
            total += size;
            sizes.push(size);
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((total, hex::encode(hasher.finalize()), sizes))
    })();

    if result.is_err() {
        let _ = fs::remove_file(final_path);
    }
    result
}

fn with_path(e: io::Error, path: &Path) -> io::Error {
    io::Error::new(e.kind(), format!("{}: {e}", path.display()))
}
