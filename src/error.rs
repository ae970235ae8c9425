//! シェル全体のエラー型。
//!
//! 構文エラーは [`ParseError`](crate::parser::ParseError) として行単位で破棄され、
//! プロセス生成・パイプ作成・ジョブテーブル満杯などのリソースエラーはパイプライン単位で報告される。
//! 起動時のプロセスグループ/ターミナル確保の失敗のみが致命的。

use std::io;

use thiserror::Error;

use crate::parser::ParseError;

/// コントローラが扱うエラー。表示は `hopsh: {}` の形で stderr に出す。
#[derive(Debug, Error)]
pub enum ShellError {
    /// 行の構文エラー。その行だけを破棄する。
    #[error("{0}")]
    Syntax(#[from] ParseError),
    /// `pipe(2)` の失敗。
    #[error("pipe: {0}")]
    Pipe(#[source] io::Error),
    /// `fork(2)` の失敗。
    #[error("fork: {0}")]
    Fork(#[source] io::Error),
    /// ジョブテーブルが満杯。起動済みのプロセスは追跡されないまま実行を続ける。
    #[error("job table full ({capacity} jobs); process group {pgid} is untracked")]
    JobTableFull { capacity: usize, pgid: libc::pid_t },
    /// エイリアステーブルが満杯で、新しい名前を登録できない。
    #[error("alias table full ({capacity} aliases)")]
    AliasTableFull { capacity: usize },
    /// `fg` / `bg` / `ping` で指定したジョブが存在しない。
    #[error("job not found: {0}")]
    NoSuchJob(String),
    /// `tcsetpgrp` / `tcgetattr` などターミナル制御の失敗。
    #[error("terminal: {0}")]
    Terminal(#[source] io::Error),
    /// シェル自身のプロセスグループを確立できない。
    #[error("setpgid: {0}")]
    ProcessGroup(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ShellError {
    /// エラーに対応する終了ステータス。構文エラーは 2、それ以外は 1。
    pub fn exit_status(&self) -> i32 {
        match self {
            Self::Syntax(_) => 2,
            _ => 1,
        }
    }
}

/// 直前の libc 呼び出しが -1 を返したときに errno を `io::Error` として取り出す。
pub(crate) fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}
