//! 外部コマンド実行
//!
//! 1 本のプロセスを起動し、stdout / stderr を行単位でコールバックへ流しながら
//! 終了まで待つ。プロビジョニング（clone, compile）とワーカー起動で共用する。
//! リトライはしない。

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DatagenError, Result};

/// 終了確認の間隔（出力が無い間だけ効く）
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// 終了後に残り出力を待つ上限
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// 1 行ごとに呼ばれる出力シンク
pub type LineCallback<'a> = dyn FnMut(&str) + 'a;

/// 起動するコマンド。シェルを介さず引数リストのまま渡す
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// ログ表示用。空白を含む引数はクォートする
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_for_display(self.program.as_os_str()))?;
        for arg in &self.args {
            write!(f, " {}", quote_for_display(arg))?;
        }
        Ok(())
    }
}

fn quote_for_display(s: &OsStr) -> String {
    let s = s.to_string_lossy();
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("{s:?}")
    } else {
        s.into_owned()
    }
}

/// 終了結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// シグナルで終了した場合は `None`
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutcome {
    fn from_status(status: ExitStatus) -> Self {
        let exit_code = status.code();
        Self {
            exit_code,
            success: exit_code == Some(0),
        }
    }

    /// ログ用の終了コード表記
    pub fn describe(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// コマンドを実行し、出力を `on_line` に流しながら終了を待つ。
///
/// stdout と stderr はそれぞれ読み取りスレッドで行に分割し、到着順に
/// 呼び出し元スレッドで `on_line` を呼ぶ。空行は捨てる。
/// プロセスが終了した時点で戻る（終了後の出力は `DRAIN_GRACE` だけ待つ）。
pub fn run(spec: &CommandSpec, on_line: &mut LineCallback<'_>) -> Result<CommandOutcome> {
    let mut child = spec
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| DatagenError::Spawn {
            command: spec.to_string(),
            source,
        })?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, tx.clone()));
    }
    // 両方の読み取りスレッドが終わった時点で rx が閉じる
    drop(tx);

    // 終了判定はパイプの EOF ではなくプロセスの終了で行う。
    // 子がバックグラウンドプロセスに stdout を渡していても待ち続けない
    let status = loop {
        match rx.recv_timeout(EXIT_POLL_INTERVAL) {
            Ok(line) => on_line(&line),
            Err(RecvTimeoutError::Timeout) => {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break child.wait()?,
        }
    };

    // 終了後にパイプに残っている行を猶予時間内だけ回収する
    let deadline = Instant::now() + DRAIN_GRACE;
    let mut closed = false;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(remaining) {
            Ok(line) => on_line(&line),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                closed = true;
                break;
            }
        }
    }
    if closed {
        for reader in readers {
            let _ = reader.join();
        }
    } else {
        // パイプを握ったままの孫プロセスがいる。読み取りスレッドは切り離す
        log::debug!("output of `{spec}` still open after exit; detaching readers");
    }

    Ok(CommandOutcome::from_status(status))
}

/// 出力を `log` に流す版。各行に `[label]` を付ける
pub fn run_logged(spec: &CommandSpec, label: &str) -> Result<CommandOutcome> {
    log::info!(">> {spec}");
    run(spec, &mut |line| log::info!("[{label}] {line}"))
}

/// プロビジョニング用。非 0 終了を [`DatagenError::Provisioning`] にする
pub fn run_step(spec: &CommandSpec, step: &str) -> Result<()> {
    let outcome = run_logged(spec, step)?;
    if !outcome.success {
        log::error!("!! command failed ({}): {spec}", outcome.describe());
        return Err(DatagenError::Provisioning {
            step: step.to_string(),
            reason: format!("`{spec}` failed with {}", outcome.describe()),
        });
    }
    Ok(())
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    tx: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        let _ = for_each_line(reader, |line| tx.send(line).is_ok());
    })
}

/// `\n` と `\r` の両方を区切りとして行を切り出す。
///
/// `\r` だけで上書き表示される進捗行も届いた時点で流すため、
/// `BufRead::lines` ではなく自前で分割する。`f` が `false` を返したら打ち切る。
pub(crate) fn for_each_line<R: BufRead>(
    mut reader: R,
    mut f: impl FnMut(String) -> bool,
) -> io::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if buf.is_empty() {
            break;
        }
        let len = buf.len();
        for &b in buf {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if !f(line) {
                        return Ok(());
                    }
                }
            } else {
                pending.push(b);
            }
        }
        reader.consume(len);
    }
    if !pending.is_empty() {
        f(String::from_utf8_lossy(&pending).into_owned());
    }
    Ok(())
}
