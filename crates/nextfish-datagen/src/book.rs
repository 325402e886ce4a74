//! PGN → 開始局面ブック（1 行 1 局の指し手列）変換

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::Result;

/// `{...}` コメント（複数行にまたがる）
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*?\}").expect("valid comment pattern"));

/// 手数表記 `12.` / `12...`
static MOVE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.+").expect("valid move number pattern"));

const RESULT_MARKERS: [&str; 4] = ["1-0", "0-1", "1/2-1/2", "*"];

/// PGN テキストから各対局の指し手列を取り出す。
///
/// タグ行（`[` で始まる行）の塊の後ろに続く行を 1 局分の棋譜とみなす。
/// 指し手の無い対局は捨てる。
pub fn extract_move_sequences(pgn: &str) -> Vec<String> {
    let without_comments = COMMENT.replace_all(pgn, " ");

    let mut games = Vec::new();
    let mut movetext = String::new();
    for line in without_comments.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            if !movetext.is_empty() {
                push_game(&mut games, &movetext);
                movetext.clear();
            }
            continue;
        }
        if line.is_empty() {
            continue;
        }
        movetext.push(' ');
        movetext.push_str(line);
    }
    if !movetext.is_empty() {
        push_game(&mut games, &movetext);
    }
    games
}

fn push_game(games: &mut Vec<String>, movetext: &str) {
    let stripped = MOVE_NUMBER.replace_all(movetext, " ");
    let moves: Vec<&str> = stripped
        .split_whitespace()
        .filter(|tok| !RESULT_MARKERS.contains(tok))
        .collect();
    if !moves.is_empty() {
        games.push(moves.join(" "));
    }
}

/// `input` の PGN を読み、1 行 1 局で `output` に書き出す。書いた局数を返す
pub fn convert_pgn_file(input: &Path, output: &Path) -> Result<usize> {
    let text = fs::read_to_string(input)?;
    let games = extract_move_sequences(&text);

    let mut w = BufWriter::new(fs::File::create(output)?);
    for g in &games {
        writeln!(w, "{g}")?;
    }
    w.flush()?;

    log::info!(
        "book: {} games from {} -> {}",
        games.len(),
        input.display(),
        output.display()
    );
    Ok(games.len())
}
