//! ターミナル所有権の管理。
//!
//! 制御端末のフォアグラウンドプロセスグループは常に 1 つだけ。
//! フォアグラウンドジョブの実行前に [`Terminal::hand_to`] でジョブに渡し、
//! 返される [`ForegroundGuard`] の Drop でシェルに取り戻す。
//! 正常終了・停止・エラーのどの経路でも必ず取り戻される。
//!
//! 標準入力が端末でない（非対話モード）場合、ターミナル操作はすべて何もしない。

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::error::{check, ShellError};
use crate::signals;

/// シェルの端末状態。起動時に一度だけ作られ、[`Shell`](crate::shell::Shell) が所有する。
pub struct Terminal {
    fd: RawFd,
    interactive: bool,
    /// シェル自身のプロセスグループ ID。
    shell_pgid: libc::pid_t,
    /// 起動時に保存したシェルの termios。シェルが端末を取り戻すたびに復元する。
    shell_modes: Option<libc::termios>,
}

impl Terminal {
    /// 対話シェルとして端末を掌握する。
    ///
    /// 1. シェルがフォアグラウンドになるまで SIGTTIN で自分を止める
    /// 2. ジョブ制御シグナルを無視し、SIGCHLD ハンドラを登録する
    /// 3. 自分をプロセスグループリーダーにする
    /// 4. `tcsetpgrp` で端末を取り、termios を保存する
    ///
    /// 標準入力が端末でなければ SIGCHLD ハンドラだけを登録して [`Terminal::detached`] を返す。
    pub fn acquire(fd: RawFd) -> Result<Self, ShellError> {
        if unsafe { libc::isatty(fd) } == 0 {
            signals::install_child_handler()?;
            return Ok(Self::detached());
        }

        unsafe {
            loop {
                let fg = libc::tcgetpgrp(fd);
                let own = libc::getpgrp();
                if fg == own {
                    break;
                }
                libc::kill(-own, libc::SIGTTIN);
            }
        }
        // 以降の tcsetpgrp で SIGTTOU に止められないよう、先に無視する
        signals::install_shell_handlers()?;

        let pid = unsafe { libc::getpid() };
        if let Err(e) = check(unsafe { libc::setpgid(pid, pid) }) {
            // セッションリーダーは setpgid できないが、既にグループリーダーなら問題ない
            if unsafe { libc::getpgrp() } != pid {
                return Err(ShellError::ProcessGroup(e));
            }
        }
        check(unsafe { libc::tcsetpgrp(fd, pid) }).map_err(ShellError::Terminal)?;

        let mut modes: libc::termios = unsafe { std::mem::zeroed() };
        check(unsafe { libc::tcgetattr(fd, &mut modes) }).map_err(ShellError::Terminal)?;

        debug!(pgid = pid, "terminal acquired");
        Ok(Self {
            fd,
            interactive: true,
            shell_pgid: pid,
            shell_modes: Some(modes),
        })
    }

    /// 端末を持たないシェル。プロセスグループは作るが端末の受け渡しはしない。
    pub fn detached() -> Self {
        Self {
            fd: libc::STDIN_FILENO,
            interactive: false,
            shell_pgid: unsafe { libc::getpgrp() },
            shell_modes: None,
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn shell_pgid(&self) -> libc::pid_t {
        self.shell_pgid
    }

    /// 現在の termios を取得する。停止したジョブの端末モードの保存に使う。
    pub fn snapshot(&self) -> Option<libc::termios> {
        if !self.interactive {
            return None;
        }
        let mut modes: libc::termios = unsafe { std::mem::zeroed() };
        match check(unsafe { libc::tcgetattr(self.fd, &mut modes) }) {
            Ok(_) => Some(modes),
            Err(e) => {
                warn!(error = %e, "tcgetattr failed");
                None
            }
        }
    }

    /// `pgid` を端末のフォアグラウンドグループにする。
    ///
    /// 再開するジョブの保存済み端末モードがあれば、それも適用する。
    /// 戻り値のガードが破棄されると端末はシェルに戻る。
    pub fn hand_to(&self, pgid: libc::pid_t, modes: Option<&libc::termios>) -> ForegroundGuard<'_> {
        if self.interactive {
            if let Err(e) = set_foreground(self.fd, pgid) {
                warn!(pgid, error = %e, "tcsetpgrp failed");
            }
            if let Some(modes) = modes {
                unsafe {
                    libc::tcsetattr(self.fd, libc::TCSADRAIN, modes);
                }
            }
            debug!(pgid, "terminal handed to job");
        }
        self.reclaim_on_drop()
    }

    /// 端末を渡さずにガードだけを作る。
    ///
    /// 子プロセス側で既に `tcsetpgrp` 済みのとき、取り戻しだけを予約するのに使う。
    pub fn reclaim_on_drop(&self) -> ForegroundGuard<'_> {
        ForegroundGuard { terminal: self }
    }

    /// 端末をシェルに戻し、シェルの termios を復元する。
    fn reclaim(&self) {
        if !self.interactive {
            return;
        }
        if let Err(e) = set_foreground(self.fd, self.shell_pgid) {
            warn!(error = %e, "failed to reclaim terminal");
        }
        if let Some(modes) = &self.shell_modes {
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSADRAIN, modes);
            }
        }
        debug!(pgid = self.shell_pgid, "terminal reclaimed");
    }
}

/// 端末の受け渡しを行う。シェルは SIGTTOU を無視しているのでバックグラウンドからでも止まらない。
pub fn set_foreground(fd: RawFd, pgid: libc::pid_t) -> io::Result<()> {
    check(unsafe { libc::tcsetpgrp(fd, pgid) }).map(|_| ())
}

/// フォアグラウンドジョブが端末を持っている間だけ生存するガード。
pub struct ForegroundGuard<'a> {
    terminal: &'a Terminal,
}

impl Drop for ForegroundGuard<'_> {
    fn drop(&mut self) {
        self.terminal.reclaim();
    }
}
