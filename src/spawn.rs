//! パイプラインの 1 ステージを `fork()` で起動する。
//!
//! 子プロセスでのセットアップ順序:
//!
//! 1. `setpgid` でパイプラインのプロセスグループに入る（最初のステージはリーダー）
//! 2. フォアグラウンドなら `tcsetpgrp` で端末を取る（SIGTTOU がまだ無視されている間に行う）
//! 3. ジョブ制御シグナルを `SIG_DFL` に戻す
//! 4. パイプ fd を stdin/stdout に `dup2` し、不要なパイプ端を閉じる
//! 5. ファイルリダイレクトを開いて上書きする
//! 6. ビルトインを実行して `_exit`、または `execvp`
//!
//! ## 構成
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`StagePlan`] | 1 ステージ分の fd・プロセスグループ・端末の指定 |
//! | [`ExecError`] | `execvp` 失敗の分類（127 / 126） |
//! | `CStringVec` | argv 用の NULL 終端ポインタ配列（fork 前に構築） |
//! | [`fork_stage`] | 上記を組み合わせて子を作る公開関数 |

use std::ffi::{CStr, CString};
use std::fmt;
use std::io::{self, Write};
use std::os::unix::io::RawFd;

use crate::error::{check, ShellError};
use crate::parser::SimpleCommand;
use crate::signals;

// ── エラー型 ──────────────────────────────────────────────────────

/// `execvp` の失敗を表すエラー。子プロセスの中でのみ生成される。
pub struct ExecError {
    /// errno 値。
    pub errno: i32,
    /// コマンド名（エラーメッセージ用）。
    pub command: String,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.errno {
            libc::ENOENT => "command not found",
            libc::EACCES | libc::EPERM | libc::ENOEXEC => "permission denied",
            _ => "exec failed",
        };
        write!(f, "hopsh: {}: {}", self.command, msg)
    }
}

impl ExecError {
    /// エラーに対応する終了ステータスを返す。
    /// 127 = command not found, 126 = 実行できない, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self.errno {
            libc::ENOENT => 127,
            libc::EACCES | libc::EPERM | libc::ENOEXEC => 126,
            _ => 1,
        }
    }
}

// ── CStringVec ────────────────────────────────────────────────────

/// argv 用の CString ベクタ。NULL 終端のポインタ配列を構築する。
///
/// 子プロセスでのメモリ確保を避けるため、fork 前に組み立てておく。
struct CStringVec {
    strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl CStringVec {
    /// 引数リストから構築する。NUL バイトを含む引数は `InvalidInput`。
    fn from_args(args: &[String]) -> io::Result<Self> {
        let strings = args
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        ptrs.push(std::ptr::null()); // NULL 終端
        Ok(Self { strings, ptrs })
    }

    fn program(&self) -> Option<&CStr> {
        self.strings.first().map(CString::as_c_str)
    }
}

// ── リダイレクト ──────────────────────────────────────────────────

/// 子プロセスで開くリダイレクト先。パスは fork 前に CString 化しておく。
struct Redirections {
    input: Option<CString>,
    output: Option<(CString, bool)>,
}

impl Redirections {
    fn from_command(cmd: &SimpleCommand) -> io::Result<Self> {
        let to_c = |s: &str| {
            CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        };
        Ok(Self {
            input: cmd.input.as_deref().map(to_c).transpose()?,
            output: cmd
                .output
                .as_deref()
                .map(|s| to_c(s).map(|c| (c, cmd.append)))
                .transpose()?,
        })
    }

    /// リダイレクトを stdin/stdout に適用する。パイプ接続より後に呼ぶので上書きになる。
    /// 失敗したらパスと errno を返す。
    fn apply(&self) -> Result<(), (&CStr, io::Error)> {
        if let Some(path) = &self.input {
            open_onto(path, libc::O_RDONLY, libc::STDIN_FILENO).map_err(|e| (path.as_c_str(), e))?;
        }
        if let Some((path, append)) = &self.output {
            let mode = if *append { libc::O_APPEND } else { libc::O_TRUNC };
            open_onto(path, libc::O_WRONLY | libc::O_CREAT | mode, libc::STDOUT_FILENO)
                .map_err(|e| (path.as_c_str(), e))?;
        }
        Ok(())
    }
}

/// `path` を開いて `target` に `dup2` する。
fn open_onto(path: &CStr, flags: libc::c_int, target: RawFd) -> io::Result<()> {
    let fd = check(unsafe { libc::open(path.as_ptr(), flags, 0o644 as libc::c_uint) })?;
    if fd != target {
        let dup = check(unsafe { libc::dup2(fd, target) });
        unsafe {
            libc::close(fd);
        }
        dup?;
    }
    Ok(())
}

/// `fd` を `target` に付け替えて元の fd を閉じる。
fn move_fd(fd: RawFd, target: RawFd) {
    if fd != target {
        unsafe {
            libc::dup2(fd, target);
            libc::close(fd);
        }
    }
}

// ── fork ──────────────────────────────────────────────────────────

/// 1 ステージ分の起動指定。
pub struct StagePlan<'a> {
    pub command: &'a SimpleCommand,
    /// 参加するプロセスグループ。0 なら子自身がリーダーになる。
    pub pgid: libc::pid_t,
    /// フォアグラウンドジョブなら端末の fd。子が自分で `tcsetpgrp` する。
    pub terminal: Option<RawFd>,
    /// 前ステージのパイプ読み込み端。
    pub stdin: Option<RawFd>,
    /// 次ステージへのパイプ書き込み端。
    pub stdout: Option<RawFd>,
    /// 子で閉じるべき fd（次ステージ用パイプの読み込み端）。
    pub close: Option<RawFd>,
}

/// ステージを fork する。成功時は子 PID を返す。
///
/// `builtin` が与えられれば子はそれを実行して終了する。なければ `execvp` する。
/// 親側でも `setpgid` を呼び、子がグループに入る前に親が pgid を使う競合を防ぐ。
pub fn fork_stage(
    plan: &StagePlan<'_>,
    builtin: Option<&mut dyn FnMut() -> i32>,
) -> Result<libc::pid_t, ShellError> {
    let argv = match builtin {
        Some(_) => None,
        None => Some(CStringVec::from_args(&plan.command.args)?),
    };
    let redirections = Redirections::from_command(plan.command)?;

    // 子の stdout バッファに親の未出力分が複製されないようにする
    let _ = io::stdout().flush();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ShellError::Fork(io::Error::last_os_error()));
    }
    if pid == 0 {
        let status = run_child(plan, &redirections, argv.as_ref(), builtin);
        let _ = io::stdout().flush();
        unsafe { libc::_exit(status) }
    }

    let pgid = if plan.pgid == 0 { pid } else { plan.pgid };
    unsafe {
        libc::setpgid(pid, pgid);
    }
    Ok(pid)
}

/// 子プロセス側の処理。戻り値は `_exit` のステータス。
fn run_child(
    plan: &StagePlan<'_>,
    redirections: &Redirections,
    argv: Option<&CStringVec>,
    builtin: Option<&mut dyn FnMut() -> i32>,
) -> i32 {
    unsafe {
        let pgid = if plan.pgid == 0 { libc::getpid() } else { plan.pgid };
        libc::setpgid(0, pgid);
        if let Some(fd) = plan.terminal {
            libc::tcsetpgrp(fd, pgid);
        }
    }
    signals::reset_in_child();

    if let Some(fd) = plan.close {
        unsafe {
            libc::close(fd);
        }
    }
    if let Some(fd) = plan.stdin {
        move_fd(fd, libc::STDIN_FILENO);
    }
    if let Some(fd) = plan.stdout {
        move_fd(fd, libc::STDOUT_FILENO);
    }
    if let Err((path, e)) = redirections.apply() {
        eprintln!("hopsh: {}: {}", path.to_string_lossy(), e);
        return 1;
    }

    match (builtin, argv) {
        (Some(run), _) => run(),
        (None, Some(argv)) => {
            let err = exec(argv);
            eprintln!("{}", err);
            err.exit_status()
        }
        (None, None) => 0,
    }
}

/// `execvp` でプロセスイメージを置き換える。戻るのは失敗したときだけ。
fn exec(argv: &CStringVec) -> ExecError {
    let program = match argv.program() {
        Some(p) => p,
        None => {
            return ExecError {
                errno: libc::ENOENT,
                command: String::new(),
            }
        }
    };
    unsafe {
        libc::execvp(program.as_ptr(), argv.ptrs.as_ptr());
    }
    ExecError {
        errno: io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT),
        command: program.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_error_status_and_message() {
        let e = ExecError {
            errno: libc::ENOENT,
            command: "nope".into(),
        };
        assert_eq!(e.exit_status(), 127);
        assert_eq!(e.to_string(), "hopsh: nope: command not found");

        let e = ExecError {
            errno: libc::EACCES,
            command: "/etc/passwd".into(),
        };
        assert_eq!(e.exit_status(), 126);
        assert_eq!(e.to_string(), "hopsh: /etc/passwd: permission denied");
    }

    #[test]
    fn argv_is_null_terminated() {
        let args = vec!["ls".to_string(), "-l".to_string()];
        let v = CStringVec::from_args(&args).unwrap();
        assert_eq!(v.ptrs.len(), 3);
        assert!(v.ptrs[2].is_null());
        assert_eq!(v.program().unwrap().to_str().unwrap(), "ls");
    }

    #[test]
    fn nul_byte_in_argument_is_rejected() {
        let args = vec!["a\0b".to_string()];
        let err = CStringVec::from_args(&args).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn redirections_keep_append_flag() {
        let cmd = SimpleCommand {
            args: vec!["cat".into()],
            input: Some("in.txt".into()),
            output: Some("out.txt".into()),
            append: true,
        };
        let r = Redirections::from_command(&cmd).unwrap();
        assert_eq!(r.input.unwrap().to_str().unwrap(), "in.txt");
        let (out, append) = r.output.unwrap();
        assert_eq!(out.to_str().unwrap(), "out.txt");
        assert!(append);
    }
}
