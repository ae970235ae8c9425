//! パイプラインの実行: ビルトイン判定、ステージの fork、パイプ接続、ジョブ制御。
//!
//! - [`launch`]: パイプライン 1 つを実行して終了ステータスを返す
//! - 単一ビルトイン: `&` の有無にかかわらず fork なしでシェル自身の中で実行（[`run_builtin_in_shell`]）
//! - それ以外: 各ステージを fork し、1 つのプロセスグループにまとめる（[`launch_job`]）
//!   - パイプ端は親側で [`OwnedFd`] として保持し、ステージごとに閉じる
//!   - foreground: 子と親の両方が `tcsetpgrp` し、`waitpid(-pgid, WUNTRACED)` で待機
//!   - background: ジョブテーブルに登録して `[N] pgid` を表示し、即座に返る

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::pid_t;
use tracing::{debug, warn};

use crate::builtins;
use crate::error::{check, ShellError};
use crate::job::{self, ForegroundOutcome, JobProcess, STOPPED_STATUS};
use crate::parser::{Pipeline, SimpleCommand};
use crate::shell::Shell;
use crate::spawn::{self, StagePlan};
use crate::terminal;

/// パイプラインを 1 つ実行し、終了ステータスを返す。
///
/// ディスパッチ:
/// 1. 単一ビルトイン → [`run_builtin_in_shell`]。`&` は無視する
/// 2. それ以外（外部コマンド、パイプライン） → [`launch_job`]
///
/// リソースエラー（pipe / fork 失敗）はここで報告し、ステータス 1 を返す。
pub fn launch(shell: &mut Shell, pipeline: &Pipeline) -> i32 {
    if pipeline.stages.len() == 1 {
        let cmd = &pipeline.stages[0];
        if builtins::is_builtin(cmd.program()) {
            return run_builtin_in_shell(shell, cmd);
        }
    }

    match launch_job(shell, pipeline) {
        Ok(status) => status,
        Err(e) => {
            eprintln!("hopsh: {}", e);
            e.exit_status()
        }
    }
}

// ── ビルトイン（シェル内実行） ───────────────────────────────────────

/// 単一ビルトインを fork なしで実行する。
///
/// stdout リダイレクトがあればファイルを開いてから実行する。
fn run_builtin_in_shell(shell: &mut Shell, cmd: &SimpleCommand) -> i32 {
    let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
    if let Some(path) = &cmd.input {
        if let Err(e) = File::open(path) {
            eprintln!("hopsh: {}: {}", path, e);
            return 1;
        }
    }
    match open_builtin_stdout(cmd) {
        Ok(Some(mut file)) => builtins::dispatch(shell, &args, &mut file),
        Ok(None) => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let status = builtins::dispatch(shell, &args, &mut out);
            let _ = out.flush();
            status
        }
        Err(status) => status,
    }
}

/// ビルトイン用の stdout リダイレクト先ファイルを開く。
///
/// `>` / `>>` があればファイルを開いて `Ok(Some(File))` を返す。
/// stdout リダイレクトがなければ `Ok(None)` を返す（呼び出し側で `io::stdout()` を使う）。
/// ファイルオープン失敗時は `Err(1)` を返す。
fn open_builtin_stdout(cmd: &SimpleCommand) -> Result<Option<File>, i32> {
    let path = match &cmd.output {
        Some(path) => path,
        None => return Ok(None),
    };
    let opened = if cmd.append {
        OpenOptions::new().create(true).append(true).open(path)
    } else {
        File::create(path)
    };
    opened.map(Some).map_err(|e| {
        eprintln!("hopsh: {}: {}", path, e);
        1
    })
}

// ── fork パス ───────────────────────────────────────────────────────

/// `pipe(2)` を作り、(読み込み端, 書き込み端) を返す。
fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1; 2];
    check(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    // SAFETY: pipe(2) が成功したので両端とも有効で、所有者はここだけ
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// パイプラインを子プロセス群として実行する。
///
/// 処理の流れ:
/// 1. [`spawn_stages`] で全ステージを fork（失敗時は作成済みのステージを片付けて `Err`）
/// 2. ジョブテーブルに Running で登録（満杯なら報告し、追跡せずに続行）
/// 3. background → `[N] pgid` を表示して 0 を返す
///    foreground → [`job::wait_in_foreground`] で待機。端末はガードの Drop でシェルに戻る
fn launch_job(shell: &mut Shell, pipeline: &Pipeline) -> Result<i32, ShellError> {
    let terminal_fd =
        (!pipeline.background && shell.terminal.is_interactive()).then(|| shell.terminal.fd());

    let mut pids = Vec::with_capacity(pipeline.stages.len());
    let spawned = spawn_stages(shell, pipeline, terminal_fd, &mut pids);
    // 親が端末を渡した後ならエラー経路でも取り戻す
    let _guard = terminal_fd.map(|_| shell.terminal.reclaim_on_drop());
    let pgid = spawned?;
    debug!(pgid, stages = pids.len(), background = pipeline.background, "pipeline launched");

    let id = match shell.jobs.add(pgid, &pipeline.text, &pids) {
        Ok(id) => Some(id),
        Err(e) => {
            eprintln!("hopsh: {}", e);
            None
        }
    };

    if pipeline.background {
        if let Some(id) = id {
            announce_background(&mut io::stdout(), id, pgid);
        }
        return Ok(0);
    }

    let status = match id {
        Some(id) => job::wait_in_foreground(&mut shell.jobs, &shell.terminal, id),
        None => {
            let mut procs: Vec<JobProcess> = pids.iter().copied().map(JobProcess::new).collect();
            match job::wait_for_group(pgid, &mut procs) {
                ForegroundOutcome::Exited(status) => status,
                ForegroundOutcome::Stopped => {
                    eprintln!("\nhopsh: untracked process group {} stopped", pgid);
                    STOPPED_STATUS
                }
            }
        }
    };
    Ok(status)
}

/// バックグラウンド起動の通知 `[id] pgid`。
fn announce_background(out: &mut dyn Write, id: usize, pgid: pid_t) {
    let _ = writeln!(out, "[{}] {}", id, pgid);
    let _ = out.flush();
}

/// 全ステージを fork し、パイプで接続する。成功時は pgid を返す。
///
/// 作成した子の PID は `pids` に積まれる。途中で pipe / fork が失敗したら
/// 作成済みのグループを [`abort_group`] で片付けてから `Err` を返す。
fn spawn_stages(
    shell: &mut Shell,
    pipeline: &Pipeline,
    terminal_fd: Option<RawFd>,
    pids: &mut Vec<pid_t>,
) -> Result<pid_t, ShellError> {
    let last = pipeline.stages.len().saturating_sub(1);
    let mut pgid: pid_t = 0;
    let mut prev_read: Option<OwnedFd> = None;

    for (i, cmd) in pipeline.stages.iter().enumerate() {
        let (next_read, write) = if i < last {
            match make_pipe() {
                Ok((r, w)) => (Some(r), Some(w)),
                Err(e) => return Err(abort_group(pgid, pids, ShellError::Pipe(e))),
            }
        } else {
            (None, None)
        };

        let plan = StagePlan {
            command: cmd,
            pgid,
            terminal: terminal_fd,
            stdin: prev_read.as_ref().map(AsRawFd::as_raw_fd),
            stdout: write.as_ref().map(AsRawFd::as_raw_fd),
            close: next_read.as_ref().map(AsRawFd::as_raw_fd),
        };

        let forked = if builtins::is_builtin(cmd.program()) {
            let mut run = || builtins::run_forked(shell, &cmd.args);
            spawn::fork_stage(&plan, Some(&mut run as &mut dyn FnMut() -> i32))
        } else {
            spawn::fork_stage(&plan, None)
        };
        let pid = match forked {
            Ok(pid) => pid,
            Err(e) => return Err(abort_group(pgid, pids, e)),
        };
        pids.push(pid);

        if pgid == 0 {
            pgid = pid;
            if let Some(fd) = terminal_fd {
                if let Err(e) = terminal::set_foreground(fd, pgid) {
                    warn!(pgid, error = %e, "tcsetpgrp failed");
                }
            }
        }

        // 子に渡した書き込み端と前段の読み込み端はここで閉じる
        drop(write);
        prev_read = next_read;
    }

    Ok(pgid)
}

/// 途中まで作成したパイプラインを終了させ、全員を回収する。
fn abort_group(pgid: pid_t, pids: &mut Vec<pid_t>, err: ShellError) -> ShellError {
    if pgid != 0 {
        warn!(pgid, error = %err, "aborting partially launched pipeline");
        unsafe {
            libc::killpg(pgid, libc::SIGTERM);
            libc::killpg(pgid, libc::SIGCONT);
        }
        for &pid in pids.iter() {
            unsafe {
                libc::waitpid(pid, std::ptr::null_mut(), 0);
            }
        }
    }
    pids.clear();
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_notice_is_id_and_group() {
        let mut out = Vec::new();
        announce_background(&mut out, 3, 4242);
        assert_eq!(String::from_utf8(out).unwrap(), "[3] 4242\n");
    }

    #[test]
    fn pipe_ends_are_distinct_and_connected() {
        let (r, w) = make_pipe().unwrap();
        assert_ne!(r.as_raw_fd(), w.as_raw_fd());
        let mut w = File::from(w);
        w.write_all(b"x").unwrap();
        drop(w);
        let mut buf = String::new();
        io::Read::read_to_string(&mut File::from(r), &mut buf).unwrap();
        assert_eq!(buf, "x");
    }

    #[test]
    fn builtin_output_redirect_truncates_or_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut cmd = SimpleCommand {
            args: vec!["activities".into()],
            input: None,
            output: Some(path.to_string_lossy().into_owned()),
            append: false,
        };
        open_builtin_stdout(&cmd).unwrap().unwrap().write_all(b"one\n").unwrap();
        cmd.append = true;
        open_builtin_stdout(&cmd).unwrap().unwrap().write_all(b"two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one\ntwo\n");

        cmd.append = false;
        open_builtin_stdout(&cmd).unwrap().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn builtin_without_redirect_uses_stdout() {
        let cmd = SimpleCommand {
            args: vec!["activities".into()],
            ..Default::default()
        };
        assert!(open_builtin_stdout(&cmd).unwrap().is_none());
    }

    #[test]
    fn builtin_redirect_to_missing_dir_fails() {
        let cmd = SimpleCommand {
            args: vec!["activities".into()],
            output: Some("/nonexistent-dir/x".into()),
            ..Default::default()
        };
        assert_eq!(open_builtin_stdout(&cmd).err(), Some(1));
    }
}
