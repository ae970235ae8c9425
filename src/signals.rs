//! シグナル設定と SIGCHLD 通知フラグ。
//!
//! SIGCHLD ハンドラは「通知が保留中」というフラグを立てるだけで、
//! メモリ確保もジョブテーブルの変更も行わない。実際の reap は
//! メインループが [`take_pending`] でフラグを確認してから行う（[`job::reap`](crate::job::reap)）。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::check;

/// SIGCHLD を受け取ってからまだ reap していないことを示すフラグ。
static CHILD_PENDING: AtomicBool = AtomicBool::new(false);

/// シェル自身が無視するジョブ制御シグナル。子プロセスでは `SIG_DFL` に戻す。
const JOB_CONTROL_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

extern "C" fn on_sigchld(_: libc::c_int) {
    CHILD_PENDING.store(true, Ordering::SeqCst);
}

/// 保留中の通知を取り出し、フラグを下ろす。
///
/// フラグを下ろしてから reap するので、reap 中に届いた通知は次回に持ち越される。
pub fn take_pending() -> bool {
    CHILD_PENDING.swap(false, Ordering::SeqCst)
}

fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        // 行エディタの read(2) を中断させない
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        check(libc::sigaction(sig, &action, std::ptr::null_mut()))?;
    }
    Ok(())
}

/// シェルプロセスのシグナル設定: ジョブ制御シグナルを無視し、SIGCHLD ハンドラを登録する。
pub fn install_shell_handlers() -> io::Result<()> {
    for sig in JOB_CONTROL_SIGNALS {
        set_handler(sig, libc::SIG_IGN)?;
    }
    set_handler(libc::SIGCHLD, on_sigchld as libc::sighandler_t)
}

/// SIGCHLD ハンドラだけを登録する。非対話モードとテスト用。
pub fn install_child_handler() -> io::Result<()> {
    set_handler(libc::SIGCHLD, on_sigchld as libc::sighandler_t)
}

/// fork 直後の子プロセスで、継承したシグナル設定をデフォルトに戻す。
///
/// async-signal-safe な `signal(2)` だけを呼ぶ。
pub fn reset_in_child() {
    unsafe {
        for sig in JOB_CONTROL_SIGNALS {
            libc::signal(sig, libc::SIG_DFL);
        }
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    }
}
