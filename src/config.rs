//! 起動時に環境変数から解決する設定値。
//!
//! 容量はすべて設計上の上限で、利用者に見える明示的な制限として扱う。
//! ファイルの置き場所は `$HOME` 直下（未設定なら `/tmp`）を既定とし、
//! `HOPSH_*` 環境変数で上書きできる。

use std::env;
use std::path::PathBuf;

/// ジョブテーブルの既定容量。
pub const MAX_JOBS: usize = 100;
/// エイリアステーブルの既定容量。
pub const MAX_ALIASES: usize = 100;
/// 履歴バッファの既定容量。
pub const HISTORY_CAPACITY: usize = 50;

/// シェルの設定。[`Shell`](crate::shell::Shell) が所有する。
#[derive(Debug, Clone)]
pub struct Config {
    pub max_jobs: usize,
    pub max_aliases: usize,
    pub history_capacity: usize,
    /// 履歴ファイル（`HOPSH_HISTFILE`）。
    pub history_file: PathBuf,
    /// エイリアスファイル（`HOPSH_ALIASFILE`）。
    pub alias_file: PathBuf,
    /// `log` ビルトインの書き込み先（`HOPSH_LOGFILE`）。
    pub log_file: PathBuf,
}

impl Config {
    /// 環境変数から設定を組み立てる。
    pub fn from_env() -> Self {
        let home = env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        let path = |var: &str, default: &str| {
            env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(default))
        };
        let max_jobs = env::var("HOPSH_MAX_JOBS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(MAX_JOBS);

        Self {
            max_jobs,
            max_aliases: MAX_ALIASES,
            history_capacity: HISTORY_CAPACITY,
            history_file: path("HOPSH_HISTFILE", ".hopsh_history"),
            alias_file: path("HOPSH_ALIASFILE", ".hopsh_aliases"),
            log_file: path("HOPSH_LOGFILE", ".hopsh_log"),
        }
    }

    /// 全ファイルを `dir` 配下に置く設定。テストとベンチマーク用。
    pub fn in_dir(dir: &std::path::Path) -> Self {
        Self {
            max_jobs: MAX_JOBS,
            max_aliases: MAX_ALIASES,
            history_capacity: HISTORY_CAPACITY,
            history_file: dir.join(".hopsh_history"),
            alias_file: dir.join(".hopsh_aliases"),
            log_file: dir.join(".hopsh_log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_dir_places_files_under_dir() {
        let c = Config::in_dir(std::path::Path::new("/x"));
        assert_eq!(c.history_file, PathBuf::from("/x/.hopsh_history"));
        assert_eq!(c.alias_file, PathBuf::from("/x/.hopsh_aliases"));
        assert_eq!(c.log_file, PathBuf::from("/x/.hopsh_log"));
        assert_eq!(c.max_jobs, MAX_JOBS);
        assert_eq!(c.history_capacity, 50);
    }

    #[test]
    fn from_env_has_positive_capacities() {
        let c = Config::from_env();
        assert!(c.max_jobs > 0);
        assert_eq!(c.max_aliases, MAX_ALIASES);
    }
}
