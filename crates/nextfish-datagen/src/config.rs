//! 実行設定
//!
//! 設定はデフォルト値 < TOML ファイル < CLI フラグ の順に上書きされ、
//! 起動時に一度だけ [`DatagenConfig`] として確定する。確定後は変更しない。
//!
//! ```toml
//! [run]
//! workers = 4
//! nodes = 8000
//! games = 400
//! book = "book_moves.txt"
//! output_dir = "/kaggle/working/nextfish_output"
//! final_dir = "/kaggle/working"
//!
//! [provision]
//! enabled = true
//! checkout_dir = "nextfish-data"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DatagenError, Result};

// =============================================================================
// デフォルト値
// =============================================================================

pub const DEFAULT_NODES_PER_MOVE: u64 = 8000;
pub const DEFAULT_GAMES_PER_WORKER: u64 = 400;
pub const DEFAULT_OUTPUT_DIR: &str = "nextfish_output";
pub const DEFAULT_FINAL_DIR: &str = ".";
pub const DEFAULT_BOOK_FILE: &str = "book_moves.txt";
/// プロビジョニングを行わない場合のエンジンパス
pub const DEFAULT_ENGINE_PATH: &str = "nextfish";

pub const DEFAULT_REPO_URL: &str = "https://github.com/AustraliaSilver/nextfish-data";
pub const DEFAULT_CHECKOUT_DIR: &str = "nextfish-data";
pub const DEFAULT_ENGINE_NAME: &str = "nextfish";
pub const DEFAULT_PGN_FILE: &str = "UHO_2022_8mvs_+110_+119.pgn";
pub const DEFAULT_COMPILER: &str = "g++";

/// ソフトラベル用の NNUE 評価関数
pub const DEFAULT_NETWORKS: &[&str] = &[
    "https://tests.stockfishchess.org/api/nn/nn-c288c895ea92.nnue",
    "https://tests.stockfishchess.org/api/nn/nn-37f18f62d772.nnue",
];

pub const DEFAULT_COMPILE_FLAGS: &[&str] = &[
    "-O3",
    "-std=c++17",
    "-Wall",
    "-fno-exceptions",
    "-DNDEBUG",
    "-DIS_64BIT",
    "-DUSE_PTHREADS",
    "-march=native",
];

pub const DEFAULT_SOURCES: &[&str] = &[
    "benchmark.cpp",
    "bitboard.cpp",
    "evaluate.cpp",
    "main.cpp",
    "misc.cpp",
    "movegen.cpp",
    "movepick.cpp",
    "position.cpp",
    "search.cpp",
    "thread.cpp",
    "timeman.cpp",
    "tt.cpp",
    "uci.cpp",
    "ucioption.cpp",
    "tune.cpp",
    "syzygy/tbprobe.cpp",
    "nnue/nnue_accumulator.cpp",
    "nnue/nnue_misc.cpp",
    "nnue/network.cpp",
    "nnue/features/half_ka_v2_hm.cpp",
    "nnue/features/full_threats.cpp",
    "engine.cpp",
    "score.cpp",
    "memory.cpp",
    "nextfish_strategy.cpp",
    "nextfish_timeman.cpp",
    "datagen.cpp",
];

pub const DEFAULT_LINK_FLAGS: &[&str] = &["-lpthread", "-latomic"];

// =============================================================================
// 確定済み設定
// =============================================================================

/// ワーカー起動と集約に必要なパラメータ
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// 並列度（起動するワーカープロセス数）
    pub worker_count: usize,
    /// 1手あたりの探索ノード数
    pub nodes_per_move: u64,
    /// ワーカー1本あたりの対局数
    pub games_per_worker: u64,
    /// 開始局面ファイル。エンジンの作業ディレクトリからの相対パスとしてそのまま渡す
    pub book_path: PathBuf,
    /// ワーカーごとの中間出力ディレクトリ（絶対パス）
    pub output_dir: PathBuf,
    /// 最終成果物の置き場所（絶対パス）
    pub final_dir: PathBuf,
    /// エンジンバイナリ（絶対パス）
    pub engine_path: PathBuf,
    /// ワーカーの作業ディレクトリ（`None` なら呼び出し元と同じ）
    pub engine_workdir: Option<PathBuf>,
}

/// エンジンのビルド環境構築の設定
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub enabled: bool,
    pub repo_url: String,
    /// clone 先（絶対パス）
    pub checkout_dir: PathBuf,
    pub networks: Vec<String>,
    pub compiler: String,
    pub compile_flags: Vec<String>,
    pub sources: Vec<String>,
    pub link_flags: Vec<String>,
    pub engine_name: String,
    /// checkout_dir からの相対パス
    pub pgn_file: PathBuf,
    /// checkout_dir からの相対パス
    pub book_file: PathBuf,
    /// マージ成功後に checkout_dir を削除するか
    pub cleanup: bool,
}

impl ProvisionConfig {
    /// エンジンソースのディレクトリ
    pub fn src_dir(&self) -> PathBuf {
        self.checkout_dir.join("src")
    }

    /// ビルド後のエンジンバイナリ
    pub fn engine_path(&self) -> PathBuf {
        self.checkout_dir.join(&self.engine_name)
    }
}

/// 起動時に確定する設定一式
#[derive(Debug, Clone)]
pub struct DatagenConfig {
    pub run: RunConfig,
    pub provision: ProvisionConfig,
}

// =============================================================================
// ファイル / CLI からの入力
// =============================================================================

/// `[run]` テーブル。CLI フラグの上書き値としても使う
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub workers: Option<usize>,
    pub nodes: Option<u64>,
    pub games: Option<u64>,
    pub book: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub final_dir: Option<PathBuf>,
    pub engine: Option<PathBuf>,
    pub engine_workdir: Option<PathBuf>,
}

impl RunSection {
    /// `over` に値がある項目を優先して重ねる
    pub fn overlay(self, over: RunSection) -> RunSection {
        RunSection {
            workers: over.workers.or(self.workers),
            nodes: over.nodes.or(self.nodes),
            games: over.games.or(self.games),
            book: over.book.or(self.book),
            output_dir: over.output_dir.or(self.output_dir),
            final_dir: over.final_dir.or(self.final_dir),
            engine: over.engine.or(self.engine),
            engine_workdir: over.engine_workdir.or(self.engine_workdir),
        }
    }
}

/// `[provision]` テーブル
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionSection {
    pub enabled: Option<bool>,
    pub repo_url: Option<String>,
    pub checkout_dir: Option<PathBuf>,
    pub networks: Option<Vec<String>>,
    pub compiler: Option<String>,
    pub compile_flags: Option<Vec<String>>,
    pub sources: Option<Vec<String>>,
    pub link_flags: Option<Vec<String>>,
    pub engine_name: Option<String>,
    pub pgn_file: Option<PathBuf>,
    pub book_file: Option<PathBuf>,
    pub cleanup: Option<bool>,
}

/// TOML 設定ファイル
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub run: RunSection,
    pub provision: ProvisionSection,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            DatagenError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        toml::from_str(&text)
            .map_err(|e| DatagenError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DatagenError::Config(e.to_string()))
    }
}

/// CLI から渡される上書き値
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub run: RunSection,
    /// `--skip-provision`
    pub skip_provision: bool,
    /// `--keep-checkout`
    pub keep_checkout: bool,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| DatagenError::Config(format!("cannot resolve {}: {e}", path.display())))
}

impl DatagenConfig {
    /// デフォルト値・設定ファイル・CLI を重ねて設定を確定する。
    ///
    /// `cores` はワーカー数未指定時のデフォルト値として使う。
    pub fn resolve(file: FileConfig, cli: CliOverrides, cores: usize) -> Result<Self> {
        let provision = resolve_provision(file.provision, &cli)?;
        let run = resolve_run(file.run.overlay(cli.run), &provision, cores)?;
        validate(&run)?;
        if provision.enabled && provision.cleanup && run.final_dir.starts_with(&provision.checkout_dir)
        {
            return Err(DatagenError::Config(format!(
                "final directory {} must not be inside the checkout {} that is removed after merging",
                run.final_dir.display(),
                provision.checkout_dir.display()
            )));
        }
        if run.worker_count > cores {
            log::warn!(
                "worker count {} exceeds available logical cores ({cores}); workers will oversubscribe the CPU",
                run.worker_count
            );
        }
        Ok(Self { run, provision })
    }
}

fn resolve_provision(section: ProvisionSection, cli: &CliOverrides) -> Result<ProvisionConfig> {
    let enabled = !cli.skip_provision && section.enabled.unwrap_or(true);
    let checkout_dir = section.checkout_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKOUT_DIR));
    let engine_name = section.engine_name.unwrap_or_else(|| DEFAULT_ENGINE_NAME.to_string());
    if engine_name.trim().is_empty() {
        return Err(DatagenError::Config("provision.engine_name must not be empty".into()));
    }
    Ok(ProvisionConfig {
        enabled,
        repo_url: section.repo_url.unwrap_or_else(|| DEFAULT_REPO_URL.to_string()),
        checkout_dir: absolutize(&checkout_dir)?,
        networks: section.networks.unwrap_or_else(|| owned(DEFAULT_NETWORKS)),
        compiler: section.compiler.unwrap_or_else(|| DEFAULT_COMPILER.to_string()),
        compile_flags: section.compile_flags.unwrap_or_else(|| owned(DEFAULT_COMPILE_FLAGS)),
        sources: section.sources.unwrap_or_else(|| owned(DEFAULT_SOURCES)),
        link_flags: section.link_flags.unwrap_or_else(|| owned(DEFAULT_LINK_FLAGS)),
        engine_name,
        pgn_file: section.pgn_file.unwrap_or_else(|| PathBuf::from(DEFAULT_PGN_FILE)),
        book_file: section.book_file.unwrap_or_else(|| PathBuf::from(DEFAULT_BOOK_FILE)),
        cleanup: !cli.keep_checkout && section.cleanup.unwrap_or(true),
    })
}

fn resolve_run(section: RunSection, provision: &ProvisionConfig, cores: usize) -> Result<RunConfig> {
    // プロビジョニング有効時はビルド結果の場所をデフォルトにする
    let (default_engine, default_workdir, default_book) = if provision.enabled {
        (
            provision.engine_path(),
            Some(provision.checkout_dir.clone()),
            provision.book_file.clone(),
        )
    } else {
        (PathBuf::from(DEFAULT_ENGINE_PATH), None, PathBuf::from(DEFAULT_BOOK_FILE))
    };

    let engine_path = absolutize(&section.engine.unwrap_or(default_engine))?;
    let engine_workdir = match section.engine_workdir.or(default_workdir) {
        Some(dir) => Some(absolutize(&dir)?),
        None => None,
    };
    let output_dir = section.output_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    let final_dir = section.final_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_FINAL_DIR));

    Ok(RunConfig {
        worker_count: section.workers.unwrap_or(cores),
        nodes_per_move: section.nodes.unwrap_or(DEFAULT_NODES_PER_MOVE),
        games_per_worker: section.games.unwrap_or(DEFAULT_GAMES_PER_WORKER),
        book_path: section.book.unwrap_or(default_book),
        output_dir: absolutize(&output_dir)?,
        final_dir: absolutize(&final_dir)?,
        engine_path,
        engine_workdir,
    })
}

fn validate(run: &RunConfig) -> Result<()> {
    if run.worker_count == 0 {
        return Err(DatagenError::Config("worker count must be at least 1".into()));
    }
    if run.nodes_per_move == 0 {
        return Err(DatagenError::Config("nodes per move must be at least 1".into()));
    }
    if run.games_per_worker == 0 {
        return Err(DatagenError::Config("games per worker must be at least 1".into()));
    }
    // 中間ディレクトリはマージ後に丸ごと消すので、最終成果物をその中に置けない
    if run.final_dir.starts_with(&run.output_dir) {
        return Err(DatagenError::Config(format!(
            "final directory {} must not be inside the intermediate output directory {}",
            run.final_dir.display(),
            run.output_dir.display()
        )));
    }
    Ok(())
}
