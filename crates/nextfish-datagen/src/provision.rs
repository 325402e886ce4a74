//! エンジンの取得とビルド
//!
//! clone → ネットワーク取得 → コンパイル → 実行権限付与 → ブック生成 の順に進める。
//! どのステップが失敗しても実行全体を中止する（ワーカーは起動しない）。

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_ENCODING, HeaderValue};

use crate::book;
use crate::config::ProvisionConfig;
use crate::error::{DatagenError, Result};
use crate::invoker::{self, CommandSpec};

/// プロビジョニング結果
#[derive(Debug, Clone)]
pub struct ProvisionedEngine {
    pub engine_path: PathBuf,
    pub checkout_dir: PathBuf,
    /// PGN が無かった場合は `None`
    pub book_path: Option<PathBuf>,
}

pub fn provision(cfg: &ProvisionConfig) -> Result<ProvisionedEngine> {
    log::info!("--- provisioning {} into {}", cfg.repo_url, cfg.checkout_dir.display());

    step("clean", || remove_checkout(&cfg.checkout_dir))?;
    step("clone", || Ok(invoker::run_step(&clone_command(cfg), "clone")?))?;

    let src_dir = cfg.src_dir();
    step("download", || {
        let client = Client::builder().build().context("build HTTP client")?;
        for url in &cfg.networks {
            let name = network_file_name(url)
                .ok_or_else(|| anyhow!("cannot derive a file name from {url}"))?;
            let path = http_get_to_file_noclobber(&client, url, &src_dir.join(name))?;
            log::info!("network ready: {}", path.display());
        }
        Ok(())
    })?;

    step("compile", || Ok(invoker::run_step(&compile_command(cfg), "compile")?))?;

    let engine_path = cfg.engine_path();
    step("chmod", || make_executable(&engine_path))?;

    let book_path = step("book", || {
        let pgn = cfg.checkout_dir.join(&cfg.pgn_file);
        if !pgn.is_file() {
            log::warn!(
                "opening PGN {} not found; skipping book generation",
                pgn.display()
            );
            return Ok(None);
        }
        let out = cfg.checkout_dir.join(&cfg.book_file);
        book::convert_pgn_file(&pgn, &out)?;
        Ok(Some(out))
    })?;

    log::info!("engine ready: {}", engine_path.display());
    Ok(ProvisionedEngine {
        engine_path,
        checkout_dir: cfg.checkout_dir.clone(),
        book_path,
    })
}

/// ステップ本体のエラーを [`DatagenError::Provisioning`] にまとめる
fn step<T>(name: &str, body: impl FnOnce() -> anyhow::Result<T>) -> Result<T> {
    log::debug!("provision step: {name}");
    body().map_err(|e| match e.downcast::<DatagenError>() {
        Ok(DatagenError::Provisioning { step, reason }) => {
            DatagenError::Provisioning { step, reason }
        }
        Ok(other) => DatagenError::Provisioning {
            step: name.to_string(),
            reason: other.to_string(),
        },
        Err(e) => DatagenError::Provisioning {
            step: name.to_string(),
            reason: format!("{e:#}"),
        },
    })
}

fn remove_checkout(dir: &Path) -> anyhow::Result<()> {
    if dir.exists() {
        log::info!("removing existing checkout {}", dir.display());
        fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
    }
    Ok(())
}

pub fn clone_command(cfg: &ProvisionConfig) -> CommandSpec {
    CommandSpec::new("git")
        .arg("clone")
        .arg(&cfg.repo_url)
        .arg(&cfg.checkout_dir)
}

/// `src/` で実行し、バイナリは checkout 直下に出す
pub fn compile_command(cfg: &ProvisionConfig) -> CommandSpec {
    CommandSpec::new(&cfg.compiler)
        .args(&cfg.compile_flags)
        .args(&cfg.sources)
        .arg("-o")
        .arg(format!("../{}", cfg.engine_name))
        .args(&cfg.link_flags)
        .current_dir(cfg.src_dir())
}

/// URL の最後のセグメント（クエリ・フラグメント除く）
pub fn network_file_name(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

/// 既存ファイルがあればダウンロードしない
pub fn http_get_to_file_noclobber(
    client: &Client,
    url: &str,
    out_path: &Path,
) -> anyhow::Result<PathBuf> {
    if out_path.exists() {
        log::info!("{} exists; skip download", out_path.display());
        return Ok(out_path.to_path_buf());
    }
    if let Some(dir) = out_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    }
    log::info!("GET {url}");
    let mut res = client
        .get(url)
        .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
        .send()
        .with_context(|| format!("GET {url}"))?;
    let status = res.status();
    anyhow::ensure!(status.is_success(), "HTTP {status} for {url}");

    // 途中で失敗したら中途半端なファイルを残さない
    let tmp = out_path.with_extension("part");
    let copied = (|| -> anyhow::Result<()> {
        let mut f = File::create(&tmp).with_context(|| format!("open {}", tmp.display()))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = res.read(&mut buf).with_context(|| format!("read body: {url}"))?;
            if n == 0 {
                break;
            }
            f.write_all(&buf[..n])?;
        }
        f.sync_all()?;
        Ok(())
    })();
    if let Err(e) = copied {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, out_path).with_context(|| format!("rename to {}", out_path.display()))?;
    Ok(out_path.to_path_buf())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("engine binary {} missing after compile", path.display()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(path: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(
        path.exists(),
        "engine binary {} missing after compile",
        path.display()
    );
    Ok(())
}
