#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nextfish_datagen::{
    AggregationOutcome, CliOverrides, DatagenConfig, FileConfig, JobStatus, RunSection,
    run_pipeline,
};
use serial_test::serial;
use tempfile::TempDir;

/// `$9`（out）へ書き込む偽エンジン。`body` 内では `$out` と `$idx` が使える
fn fake_engine(tmp: &TempDir, body: &str) -> PathBuf {
    let path = tmp.path().join("nextfish");
    let script = format!(
        "#!/bin/sh\nout=\"$9\"\nidx=$(basename \"$out\" .binpack | sed 's/^core//')\n{body}\n"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(root: &Path, engine: PathBuf, workers: usize) -> DatagenConfig {
    let cli = CliOverrides {
        run: RunSection {
            workers: Some(workers),
            nodes: Some(8000),
            games: Some(400),
            output_dir: Some(root.join("nextfish_output")),
            final_dir: Some(root.join("final")),
            engine: Some(engine),
            engine_workdir: Some(root.to_path_buf()),
            ..Default::default()
        },
        skip_provision: true,
        keep_checkout: false,
    };
    DatagenConfig::resolve(FileConfig::default(), cli, workers).unwrap()
}

fn merged(outcome: &AggregationOutcome) -> &nextfish_datagen::AggregationResult {
    match outcome {
        AggregationOutcome::Merged(r) => r,
        AggregationOutcome::NothingToMerge => panic!("expected a merged artifact"),
    }
}

fn artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut v: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "binpack"))
        .collect();
    v.sort();
    v
}

#[test]
#[serial]
fn two_workers_concatenate_in_worker_order() {
    let tmp = TempDir::new().unwrap();
    let engine = fake_engine(
        &tmp,
        r#"if [ "$idx" = 1 ]; then printf '0123456789' > "$out"; else printf 'abcdefghijklmnopqrst' > "$out"; fi"#,
    );
    let cfg = config(tmp.path(), engine, 2);

    let report = run_pipeline(&cfg).unwrap();
    assert!(report.jobs.iter().all(|j| j.status == JobStatus::Succeeded));

    let result = merged(&report.outcome);
    assert_eq!(result.bytes_written, 30);
    let bytes = fs::read(&result.final_path).unwrap();
    assert_eq!(&bytes[..10], b"0123456789");
    assert_eq!(&bytes[10..], b"abcdefghijklmnopqrst");

    let name = result.final_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("nextfish_data_") && name.ends_with(".binpack"));
    // nextfish_data_YYYYMMDD_HHMMSS.binpack
    assert_eq!(name.len(), "nextfish_data_".len() + 15 + ".binpack".len());
    assert!(!cfg.run.output_dir.exists());
    assert_eq!(artifacts(&cfg.run.final_dir).len(), 1);
}

#[test]
#[serial]
fn failing_worker_does_not_block_the_merge() {
    let tmp = TempDir::new().unwrap();
    let engine = fake_engine(
        &tmp,
        r#"if [ "$idx" = 2 ]; then echo "segfault" 1>&2; exit 139; fi
printf "w$idx" > "$out""#,
    );
    let cfg = config(tmp.path(), engine, 3);

    let report = run_pipeline(&cfg).unwrap();
    let statuses: Vec<JobStatus> = report.jobs.iter().map(|j| j.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Succeeded, JobStatus::Failed, JobStatus::Succeeded]
    );

    let result = merged(&report.outcome);
    assert_eq!(fs::read(&result.final_path).unwrap(), b"w1w3");
    let contributors: Vec<Option<usize>> =
        result.contributing_files.iter().map(|f| f.worker_index).collect();
    assert_eq!(contributors, vec![Some(1), Some(3)]);
}

#[test]
#[serial]
fn partial_output_of_failed_worker_is_flagged() {
    let tmp = TempDir::new().unwrap();
    let engine = fake_engine(
        &tmp,
        r#"printf "w$idx" > "$out"
if [ "$idx" = 2 ]; then exit 1; fi"#,
    );
    let cfg = config(tmp.path(), engine, 2);

    let report = run_pipeline(&cfg).unwrap();
    let result = merged(&report.outcome);
    assert_eq!(fs::read(&result.final_path).unwrap(), b"w1w2");
    let flagged: Vec<bool> =
        result.contributing_files.iter().map(|f| f.possibly_truncated()).collect();
    assert_eq!(flagged, vec![false, true]);
}

#[test]
#[serial]
fn single_empty_output_yields_empty_artifact() {
    let tmp = TempDir::new().unwrap();
    let engine = fake_engine(&tmp, r#": > "$out""#);
    let cfg = config(tmp.path(), engine, 1);

    let report = run_pipeline(&cfg).unwrap();
    let result = merged(&report.outcome);
    assert_eq!(result.bytes_written, 0);
    assert_eq!(fs::metadata(&result.final_path).unwrap().len(), 0);
    assert_eq!(result.contributing_files.len(), 1);
    assert!(!cfg.run.output_dir.exists());
}

#[test]
#[serial]
fn no_output_at_all_is_nothing_to_merge() {
    let tmp = TempDir::new().unwrap();
    let engine = fake_engine(&tmp, "exit 2");
    let cfg = config(tmp.path(), engine, 2);

    let report = run_pipeline(&cfg).unwrap();
    assert!(matches!(report.outcome, AggregationOutcome::NothingToMerge));
    assert_eq!(report.summary().failed, 2);
    // 何も作らず、中間ディレクトリも残す
    assert!(cfg.run.output_dir.is_dir());
    assert!(!cfg.run.final_dir.exists());
}

#[test]
#[serial]
fn engine_runs_in_its_working_directory() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("book_moves.txt"), "e4 e5\n").unwrap();
    // book は相対パスのまま渡るので、作業ディレクトリで解決できる必要がある
    let engine = fake_engine(&tmp, r#"cat "$7" > "$out""#);
    let cfg = config(tmp.path(), engine, 1);

    let report = run_pipeline(&cfg).unwrap();
    let result = merged(&report.outcome);
    assert_eq!(fs::read_to_string(&result.final_path).unwrap(), "e4 e5\n");
}
