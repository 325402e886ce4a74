//! nextfish 自己対局データ生成
//!
//! # 使用例
//!
//! ```bash
//! # clone・ビルドから連結まで一括実行（全コア使用）
//! nextfish-datagen run
//!
//! # ビルド済みエンジンで 2 ワーカーだけ回す
//! nextfish-datagen run --skip-provision --engine ./nextfish --workers 2 --games 10
//!
//! # 起動予定のコマンドを表示するだけ
//! nextfish-datagen run --skip-provision --dry-run
//!
//! # 前回の中間ファイルを連結し直す
//! nextfish-datagen merge --output-dir nextfish_output
//!
//! # PGN から開始局面ブックを作る
//! nextfish-datagen book --pgn UHO_2022_8mvs_+110_+119.pgn --out book_moves.txt
//! ```

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use nextfish_datagen::config::{CliOverrides, DatagenConfig, FileConfig, RunSection};
use nextfish_datagen::orchestrator::{WorkerSummary, plan_jobs};
use nextfish_datagen::{AggregationOutcome, book, merge_only, run_pipeline, system};

#[derive(Parser, Debug)]
#[command(
    name = "nextfish-datagen",
    version,
    about = "nextfish 自己対局データ生成\n\nprovision → datagen ×N → merge"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// エンジンの準備・並列 datagen・連結までを実行
    Run(RunArgs),
    /// 中間ファイルの連結だけを行う
    Merge(MergeArgs),
    /// PGN を 1 行 1 局の開始局面ブックに変換
    Book {
        /// 入力 PGN
        #[arg(long)]
        pgn: PathBuf,
        /// 出力ファイル
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// ワーカー数（未指定時: 論理コア数）
    #[arg(long)]
    workers: Option<usize>,

    /// 1 手あたりの探索ノード数
    #[arg(long)]
    nodes: Option<u64>,

    /// 1 ワーカーあたりの対局数
    #[arg(long)]
    games: Option<u64>,

    /// 開始局面ブック（エンジンの作業ディレクトリからの相対パス可）
    #[arg(long)]
    book: Option<PathBuf>,

    /// 中間出力ディレクトリ
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// 最終成果物の出力先
    #[arg(long)]
    final_dir: Option<PathBuf>,

    /// エンジンバイナリ
    #[arg(long)]
    engine: Option<PathBuf>,

    /// エンジンの作業ディレクトリ
    #[arg(long)]
    engine_workdir: Option<PathBuf>,

    /// clone・ビルドを行わない
    #[arg(long)]
    skip_provision: bool,

    /// 連結後も checkout を残す
    #[arg(long)]
    keep_checkout: bool,

    /// 起動予定のコマンドを表示して終了
    #[arg(long)]
    dry_run: bool,

    /// debug ログを出す
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct MergeArgs {
    /// TOML 設定ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// 中間出力ディレクトリ
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// 最終成果物の出力先
    #[arg(long)]
    final_dir: Option<PathBuf>,

    /// debug ログを出す
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let verbose = match &cli.cmd {
        Cmd::Run(a) => a.verbose,
        Cmd::Merge(a) => a.verbose,
        Cmd::Book { .. } => false,
    };
    init_logging(verbose);

    if let Err(e) = dispatch(cli.cmd) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn dispatch(cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Run(args) => cmd_run(args),
        Cmd::Merge(args) => cmd_merge(args),
        Cmd::Book { pgn, out } => {
            let n = book::convert_pgn_file(&pgn, &out)
                .with_context(|| format!("convert {}", pgn.display()))?;
            println!("{n} games -> {}", out.display());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level),
    )
    .format(|buf, record| {
        writeln!(buf, "[{}] {}: {}", record.level(), record.target(), record.args())
    })
    .write_style(env_logger::WriteStyle::Never)
    .target(env_logger::Target::Stderr)
    .init();
}

fn load_file_config(path: Option<&PathBuf>) -> Result<FileConfig> {
    match path {
        Some(p) => Ok(FileConfig::load(p)?),
        None => Ok(FileConfig::default()),
    }
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let cores = system::logical_cores();
    log::info!("host: {} ({cores} logical cores)", system::cpu_model());

    let file = load_file_config(args.config.as_ref())?;
    let overrides = CliOverrides {
        run: RunSection {
            workers: args.workers,
            nodes: args.nodes,
            games: args.games,
            book: args.book,
            output_dir: args.output_dir,
            final_dir: args.final_dir,
            engine: args.engine,
            engine_workdir: args.engine_workdir,
        },
        skip_provision: args.skip_provision,
        keep_checkout: args.keep_checkout,
    };
    let cfg = DatagenConfig::resolve(file, overrides, cores)?;

    if args.dry_run {
        if cfg.provision.enabled {
            log::info!(
                "dry run: provisioning {} into {} would run first",
                cfg.provision.repo_url,
                cfg.provision.checkout_dir.display()
            );
        }
        for job in plan_jobs(&cfg.run) {
            println!("{}", job.command);
        }
        return Ok(());
    }

    let report = run_pipeline(&cfg)?;
    let WorkerSummary {
        total,
        succeeded,
        failed,
    } = report.summary();
    match &report.outcome {
        AggregationOutcome::Merged(result) => {
            log::info!(
                "done: {succeeded}/{total} worker(s) succeeded, {failed} failed; {} bytes in {}",
                result.bytes_written,
                result.final_path.display()
            );
            println!("{}", result.final_path.display());
        }
        AggregationOutcome::NothingToMerge => {
            log::warn!("done: {succeeded}/{total} worker(s) succeeded; no data was produced");
        }
    }
    Ok(())
}

fn cmd_merge(args: MergeArgs) -> Result<()> {
    let file = load_file_config(args.config.as_ref())?;
    let overrides = CliOverrides {
        run: RunSection {
            output_dir: args.output_dir,
            final_dir: args.final_dir,
            ..Default::default()
        },
        // 連結のみ。checkout には触れない
        skip_provision: true,
        keep_checkout: true,
    };
    let cfg = DatagenConfig::resolve(file, overrides, system::logical_cores())?;

    match merge_only(&cfg)? {
        AggregationOutcome::Merged(result) => {
            println!("{}", result.final_path.display());
        }
        AggregationOutcome::NothingToMerge => {
            log::warn!("nothing to merge in {}", cfg.run.output_dir.display());
        }
    }
    Ok(())
}
