//! ワーカーの並列起動と終了待ち
//!
//! ワーカー `i` (1 始まり) は `output_dir/core{i}.binpack` にだけ書き込む。
//! 出力先がインデックスから一意に決まるため、ワーカー間の排他は不要。
//!
//! 各ワーカーは scoped thread 上で [`invoker::run`] により駆動され、終了通知は
//! チャネル経由で届いた順に記録する。1 本が失敗しても他のワーカーは止めない。
//! 全ワーカーが終了状態になるまで戻らない（全体のタイムアウトはない）。

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;
use serde::Serialize;

use crate::aggregator::collect_worker_outputs;
use crate::config::RunConfig;
use crate::error::{DatagenError, Result};
use crate::invoker::{self, CommandOutcome, CommandSpec};

/// ワーカー出力ファイル名の接頭辞
pub const WORKER_FILE_PREFIX: &str = "core";
/// ワーカー出力ファイルの拡張子
pub const WORKER_FILE_EXT: &str = "binpack";

/// ワーカーの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// 1 本のワーカープロセス
#[derive(Debug, Clone)]
pub struct WorkerJob {
    /// 1 始まり
    pub index: usize,
    pub output_path: PathBuf,
    pub command: CommandSpec,
    pub status: JobStatus,
    /// 起動できなかった場合とシグナル終了の場合は `None`
    pub exit_code: Option<i32>,
    pub elapsed: Option<Duration>,
    /// 失敗理由（ログ・マニフェスト用）
    pub failure: Option<String>,
}

impl WorkerJob {
    pub fn label(&self) -> String {
        format!("{WORKER_FILE_PREFIX}{}", self.index)
    }

    fn finish(&mut self, result: Result<CommandOutcome>, elapsed: Duration) {
        self.elapsed = Some(elapsed);
        match result {
            Ok(outcome) => {
                self.exit_code = outcome.exit_code;
                if outcome.success {
                    self.status = JobStatus::Succeeded;
                } else {
                    self.status = JobStatus::Failed;
                    self.failure = Some(outcome.describe());
                }
            }
            Err(e) => {
                self.exit_code = None;
                self.status = JobStatus::Failed;
                self.failure = Some(e.to_string());
            }
        }
    }
}

/// ワーカー `index` の出力先
pub fn worker_output_path(output_dir: &Path, index: usize) -> PathBuf {
    output_dir.join(format!("{WORKER_FILE_PREFIX}{index}.{WORKER_FILE_EXT}"))
}

/// エンジンの datagen コマンドを組み立てる。
///
/// 引数の並びはエンジン側の CLI で決まっている:
/// `datagen nodes <n> games <n> book <path> out <path>`
pub fn worker_command(cfg: &RunConfig, output_path: &Path) -> CommandSpec {
    let spec = CommandSpec::new(&cfg.engine_path)
        .arg("datagen")
        .arg("nodes")
        .arg(cfg.nodes_per_move.to_string())
        .arg("games")
        .arg(cfg.games_per_worker.to_string())
        .arg("book")
        .arg(&cfg.book_path)
        .arg("out")
        .arg(output_path);
    match &cfg.engine_workdir {
        Some(dir) => spec.current_dir(dir),
        None => spec,
    }
}

/// 全ワーカーのジョブを組み立てる（起動はしない）
pub fn plan_jobs(cfg: &RunConfig) -> Vec<WorkerJob> {
    (1..=cfg.worker_count)
        .map(|index| {
            let output_path = worker_output_path(&cfg.output_dir, index);
            let command = worker_command(cfg, &output_path);
            WorkerJob {
                index,
                output_path,
                command,
                status: JobStatus::Pending,
                exit_code: None,
                elapsed: None,
                failure: None,
            }
        })
        .collect()
}

/// 中間出力ディレクトリを作成する。
///
/// エンジンは出力ファイルに追記するため、前回の `*.binpack` が残っていると
/// 2 回分が 1 つの成果物に混ざる。その場合は起動せずエラーにする。
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| DatagenError::OutputDir {
        path: dir.to_path_buf(),
        source,
    })?;
    let leftovers = collect_worker_outputs(dir).map_err(|e| match e {
        DatagenError::Io(source) => DatagenError::OutputDir {
            path: dir.to_path_buf(),
            source,
        },
        other => other,
    })?;
    if !leftovers.is_empty() {
        return Err(DatagenError::LeftoverOutputs {
            dir: dir.to_path_buf(),
            count: leftovers.len(),
        });
    }
    Ok(())
}

struct Completion {
    index: usize,
    result: Result<CommandOutcome>,
    elapsed: Duration,
}

/// 全ワーカーを起動し、全員の終了を待ってジョブ一覧を返す。
///
/// ワーカーの失敗はエラーにせず、各ジョブの `status` に記録する。
/// `Err` になるのは中間出力ディレクトリを用意できなかった場合と、
/// 前回の出力が残っている場合のみ。
pub fn run_workers(cfg: &RunConfig) -> Result<Vec<WorkerJob>> {
    prepare_output_dir(&cfg.output_dir)?;
    let mut jobs = plan_jobs(cfg);
    let total = jobs.len();

    log::info!("--- starting datagen on {total} worker(s) ---");
    let (tx, rx) = chan::unbounded::<Completion>();

    thread::scope(|s| {
        for job in jobs.iter_mut() {
            let index = job.index;
            let label = job.label();
            let command = job.command.clone();
            let tx = tx.clone();
            log::debug!("{label}: {command}");
            s.spawn(move || {
                let started = Instant::now();
                let result = invoker::run(&command, &mut |line| {
                    log::info!(target: "worker", "[{label}] {line}");
                });
                let _ = tx.send(Completion {
                    index,
                    result,
                    elapsed: started.elapsed(),
                });
            });
            job.status = JobStatus::Running;
            log::info!("[+] {} running -> {}", job.label(), job.output_path.display());
        }
        // 全ワーカーの送信側が閉じたら受信ループを抜ける
        drop(tx);

        let mut finished = 0usize;
        for done in rx.iter() {
            finished += 1;
            let job = &mut jobs[done.index - 1];
            job.finish(done.result, done.elapsed);
            match job.status {
                JobStatus::Succeeded => log::info!(
                    "[-] {} finished in {:.1}s ({finished}/{total})",
                    job.label(),
                    done.elapsed.as_secs_f64()
                ),
                _ => log::warn!(
                    "[!] {} failed: {} ({finished}/{total})",
                    job.label(),
                    job.failure.as_deref().unwrap_or("unknown")
                ),
            }
        }
    });

    // 通知を送れずに終わったスレッドは失敗扱い
    for job in jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
        job.status = JobStatus::Failed;
        job.failure = Some("worker thread ended without reporting".to_string());
    }

    let summary = WorkerSummary::from_jobs(&jobs);
    log::info!(
        "workers done: {} succeeded, {} failed (of {})",
        summary.succeeded,
        summary.failed,
        summary.total
    );
    Ok(jobs)
}

/// 成功 / 失敗の集計
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl WorkerSummary {
    pub fn from_jobs(jobs: &[WorkerJob]) -> Self {
        let succeeded = jobs.iter().filter(|j| j.status == JobStatus::Succeeded).count();
        let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
        Self {
            total: jobs.len(),
            succeeded,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::ffi::OsString;

    fn config(dir: &Path, workers: usize) -> RunConfig {
        RunConfig {
            worker_count: workers,
            nodes_per_move: 8000,
            games_per_worker: 400,
            book_path: PathBuf::from("book_moves.txt"),
            output_dir: dir.join("out"),
            final_dir: dir.to_path_buf(),
            engine_path: dir.join("nextfish"),
            engine_workdir: Some(dir.to_path_buf()),
        }
    }

    #[test]
    fn test_plan_has_one_job_per_worker_with_distinct_outputs() {
        let dir = tempfile::tempdir().unwrap();
        for n in [1, 2, 4, 13] {
            let jobs = plan_jobs(&config(dir.path(), n));
            assert_eq!(jobs.len(), n);
            let outputs: HashSet<_> = jobs.iter().map(|j| j.output_path.clone()).collect();
            assert_eq!(outputs.len(), n);
            assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
            assert_eq!(jobs.first().unwrap().index, 1);
            assert_eq!(jobs.last().unwrap().index, n);
        }
    }

    #[test]
    fn test_worker_command_shape() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), 2);
        let out = worker_output_path(&cfg.output_dir, 2);
        assert!(out.ends_with("core2.binpack"));

        let cmd = worker_command(&cfg, &out);
        assert_eq!(cmd.program, cfg.engine_path);
        assert_eq!(cmd.cwd.as_deref(), Some(dir.path()));
        let expected: Vec<OsString> = vec![
            "datagen".into(),
            "nodes".into(),
            "8000".into(),
            "games".into(),
            "400".into(),
            "book".into(),
            "book_moves.txt".into(),
            "out".into(),
            out.into_os_string(),
        ];
        assert_eq!(cmd.args, expected);
    }

    #[test]
    fn test_paths_with_spaces_stay_single_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 1);
        cfg.book_path = PathBuf::from("my books/seed moves.txt");
        let jobs = plan_jobs(&cfg);
        assert_eq!(jobs[0].command.args[6], OsString::from("my books/seed moves.txt"));
        assert_eq!(jobs[0].command.args.len(), 9);
    }

    #[test]
    fn test_prepare_output_dir_creates_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("a").join("b");
        prepare_output_dir(&out).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn test_prepare_output_dir_refuses_previous_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("core1.binpack"), b"old").unwrap();
        fs::write(out.join("core2.binpack"), b"old").unwrap();

        let err = prepare_output_dir(&out).unwrap_err();
        match &err {
            DatagenError::LeftoverOutputs { count, .. } => assert_eq!(*count, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("nextfish-datagen merge"));
        // 残りには触れない
        assert_eq!(fs::read(out.join("core1.binpack")).unwrap(), b"old");
    }

    #[test]
    fn test_prepare_output_dir_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("notes.txt"), b"x").unwrap();
        prepare_output_dir(&out).unwrap();
    }

    #[test]
    fn test_summary_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut jobs = plan_jobs(&config(dir.path(), 3));
        jobs[0].status = JobStatus::Succeeded;
        jobs[1].status = JobStatus::Failed;
        jobs[2].status = JobStatus::Succeeded;
        let summary = WorkerSummary::from_jobs(&jobs);
        assert_eq!(
            summary,
            WorkerSummary {
                total: 3,
                succeeded: 2,
                failed: 1
            }
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use serial_test::serial;
        use std::os::unix::fs::PermissionsExt;

        /// `$9` が出力先になる偽エンジン
        fn fake_engine(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-engine.sh");
            fs::write(&path, format!("#!/bin/sh\nout=\"$9\"\n{body}\n")).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        #[serial]
        fn test_run_workers_records_success_and_failure() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = config(dir.path(), 3);
            cfg.engine_path = fake_engine(
                dir.path(),
                r#"case "$out" in
  *core2.binpack) echo "boom" 1>&2; exit 3 ;;
esac
printf 'data' > "$out""#,
            );

            let jobs = run_workers(&cfg).unwrap();
            assert_eq!(jobs.len(), 3);
            assert!(jobs.iter().all(|j| j.status.is_terminal()));
            assert_eq!(jobs[0].status, JobStatus::Succeeded);
            assert_eq!(jobs[1].status, JobStatus::Failed);
            assert_eq!(jobs[1].exit_code, Some(3));
            assert_eq!(jobs[2].status, JobStatus::Succeeded);
            assert!(jobs[0].output_path.exists());
            assert!(!jobs[1].output_path.exists());
            assert!(jobs[2].output_path.exists());
        }

        #[test]
        #[serial]
        fn test_missing_engine_marks_every_job_failed() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = config(dir.path(), 2);
            cfg.engine_path = dir.path().join("does-not-exist");
            let jobs = run_workers(&cfg).unwrap();
            assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
            assert!(jobs.iter().all(|j| j.exit_code.is_none()));
            assert!(jobs[0].failure.as_deref().unwrap().contains("failed to spawn"));
        }

        #[test]
        #[serial]
        fn test_workers_run_concurrently() {
            // 各ワーカーが相手のマーカーを待つので、逐次実行だと片方が必ず失敗する
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = config(dir.path(), 2);
            let marker_dir = dir.path().join("markers");
            fs::create_dir_all(&marker_dir).unwrap();
            cfg.engine_path = fake_engine(
                dir.path(),
                &format!(
                    r#"me=$(basename "$out" .binpack)
touch "{m}/$me"
i=0
while [ $(ls "{m}" | wc -l) -lt 2 ]; do
  i=$((i+1))
  if [ $i -gt 100 ]; then exit 1; fi
  sleep 0.05
done
: > "$out""#,
                    m = marker_dir.display()
                ),
            );
            let jobs = run_workers(&cfg).unwrap();
            assert!(jobs.iter().all(|j| j.status == JobStatus::Succeeded));
        }
    }
}
