//! 実行環境の情報収集

use sysinfo::System;

/// 論理コア数を返す（取得できない環境では 1）
///
/// ワーカー数のデフォルト値と、過剰並列の警告判定に使う。
pub fn logical_cores() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.cpus().len().max(1)
}

/// CPU モデル名（ログ出力用）
pub fn cpu_model() -> String {
    let mut sys = System::new();
    sys.refresh_cpu_all();
    sys.cpus().first().map(|cpu| cpu.brand()).unwrap_or("Unknown").to_string()
}
