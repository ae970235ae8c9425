//! ジョブテーブルとジョブ制御ヘルパー。
//!
//! フォアグラウンド待機 ([`wait_for_group`] / [`wait_in_foreground`])、
//! SIGCHLD 後の reap ([`reap`] / [`apply_events`]) を提供する。
//! executor と builtins (`fg`) の両方から利用し、循環依存を回避する。
//!
//! ## 状態遷移
//!
//! ```text
//! Running --停止シグナル--> Stopped --SIGCONT--> Running --全員終了--> Done --通知して削除--> (なし)
//! ```

use std::fmt;
use std::io::{self, Write};

use libc::pid_t;
use tracing::debug;

use crate::error::ShellError;
use crate::terminal::Terminal;

// ── 子プロセスの状態変化 ─────────────────────────────────────────────

/// `waitpid` が返す状態変化を分類したもの。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    /// 正常終了。引数は終了コード。
    Exited(i32),
    /// シグナルで終了。引数はシグナル番号。
    Signaled(i32),
    /// 停止（SIGTSTP 等）。引数はシグナル番号。
    Stopped(i32),
    /// SIGCONT で再開。
    Continued,
}

impl ChildEvent {
    /// `waitpid` の raw status を分類する。未知の値は `None`。
    pub fn from_raw(status: i32) -> Option<Self> {
        if libc::WIFEXITED(status) {
            Some(Self::Exited(libc::WEXITSTATUS(status)))
        } else if libc::WIFSIGNALED(status) {
            Some(Self::Signaled(libc::WTERMSIG(status)))
        } else if libc::WIFSTOPPED(status) {
            Some(Self::Stopped(libc::WSTOPSIG(status)))
        } else if libc::WIFCONTINUED(status) {
            Some(Self::Continued)
        } else {
            None
        }
    }
}

/// ジョブ内の個別プロセスの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Stopped,
    /// 終了済み。引数はシェルの終了ステータス表現（シグナル終了なら 128 + シグナル番号）。
    Done(i32),
}

/// ジョブ内の個別プロセス。パイプライン中の各ステージに対応する。
#[derive(Debug, Clone, PartialEq)]
pub struct JobProcess {
    pub pid: pid_t,
    pub state: ProcState,
}

impl JobProcess {
    pub fn new(pid: pid_t) -> Self {
        Self {
            pid,
            state: ProcState::Running,
        }
    }

    fn apply(&mut self, event: ChildEvent) {
        self.state = match event {
            ChildEvent::Exited(code) => ProcState::Done(code),
            ChildEvent::Signaled(sig) => ProcState::Done(128 + sig),
            ChildEvent::Stopped(_) => ProcState::Stopped,
            ChildEvent::Continued => ProcState::Running,
        };
    }

    fn is_done(&self) -> bool {
        matches!(self.state, ProcState::Done(_))
    }
}

/// 停止時に返す終了ステータス（128 + SIGTSTP）。
pub const STOPPED_STATUS: i32 = 148;

/// プロセス列の集約状態。判定優先度: Stopped > Done > Running。
fn aggregate(processes: &[JobProcess]) -> JobStatus {
    if processes.iter().any(|p| p.state == ProcState::Stopped) {
        JobStatus::Stopped
    } else if processes.iter().all(JobProcess::is_done) {
        JobStatus::Done
    } else {
        JobStatus::Running
    }
}

/// 最終ステージの終了ステータス。
fn last_status(processes: &[JobProcess]) -> i32 {
    match processes.last().map(|p| p.state) {
        Some(ProcState::Done(code)) => code,
        _ => 0,
    }
}

// ── Job ─────────────────────────────────────────────────────────────

/// ジョブの状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Stopped,
    Done,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Done => "Done",
        })
    }
}

/// ジョブ。パイプラインのプロセスグループに対応する。
pub struct Job {
    /// `[N]` 形式で表示されるジョブ番号。セッション中は再利用しない。
    pub id: usize,
    /// プロセスグループ ID。`killpg(pgid, sig)` や `waitpid(-pgid, ...)` で使用。
    pub pgid: pid_t,
    /// 表示用コマンド文字列（パーサーが消費したソースそのもの）。
    pub command: String,
    pub status: JobStatus,
    /// 停止時に保存した端末モード。`fg` で再開するときに復元する。
    pub tmodes: Option<libc::termios>,
    pub processes: Vec<JobProcess>,
}

impl Job {
    /// プロセスの状態変化を反映し、ジョブの状態を再計算する。
    /// 該当 PID がこのジョブに属さなければ `false`。
    fn apply(&mut self, pid: pid_t, event: ChildEvent) -> bool {
        match self.processes.iter_mut().find(|p| p.pid == pid) {
            Some(p) => p.apply(event),
            None => return false,
        }
        self.status = aggregate(&self.processes);
        true
    }

    /// SIGCONT を送った直後に呼ぶ。停止中のメンバーを実行中に戻す。
    pub fn mark_continued(&mut self) {
        for p in &mut self.processes {
            if p.state == ProcState::Stopped {
                p.state = ProcState::Running;
            }
        }
        self.status = JobStatus::Running;
    }
}

// ── JobTable ────────────────────────────────────────────────────────

/// 固定容量のジョブテーブル。
///
/// [`Shell`](crate::shell::Shell) が所有し、executor・builtins・reap から参照される。
/// ジョブ ID は 1 から始まり、ジョブが削除されても単調増加し続ける。
pub struct JobTable {
    jobs: Vec<Job>,
    capacity: usize,
    next_id: usize,
}

impl JobTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Vec::new(),
            capacity,
            next_id: 1,
        }
    }

    /// ジョブを Running で登録し、割り当てた ID を返す。
    ///
    /// 満杯なら登録を拒否する。呼び出し側のプロセスは追跡されないまま実行を続ける。
    pub fn add(&mut self, pgid: pid_t, command: &str, pids: &[pid_t]) -> Result<usize, ShellError> {
        if self.jobs.len() >= self.capacity {
            return Err(ShellError::JobTableFull {
                capacity: self.capacity,
                pgid,
            });
        }
        // 同じ pgid のジョブは 1 つだけ
        self.remove_by_pgid(pgid);

        let id = self.next_id;
        self.next_id += 1;
        self.jobs.push(Job {
            id,
            pgid,
            command: command.to_string(),
            status: JobStatus::Running,
            tmodes: None,
            processes: pids.iter().copied().map(JobProcess::new).collect(),
        });
        Ok(id)
    }

    /// pgid でジョブを削除する。後続のジョブは詰められる。
    pub fn remove_by_pgid(&mut self, pgid: pid_t) -> Option<Job> {
        let idx = self.jobs.iter().position(|j| j.pgid == pgid)?;
        Some(self.jobs.remove(idx))
    }

    pub fn get(&self, id: usize) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn find_by_pgid(&self, pgid: pid_t) -> Option<&Job> {
        self.jobs.iter().find(|j| j.pgid == pgid)
    }

    /// pgid のジョブの状態を直接設定する。該当がなければ `false`。
    pub fn set_status(&mut self, pgid: pid_t, status: JobStatus) -> bool {
        match self.jobs.iter_mut().find(|j| j.pgid == pgid) {
            Some(job) => {
                job.status = status;
                true
            }
            None => false,
        }
    }

    /// 最も新しいジョブの ID。`fg` / `bg` の引数省略時に使う。
    pub fn current(&self) -> Option<usize> {
        self.jobs.last().map(|j| j.id)
    }

    /// `%N` / `N` 形式のジョブ指定を解決する。省略時は最新のジョブ。
    pub fn resolve(&self, spec: Option<&str>) -> Result<usize, ShellError> {
        match spec {
            None => self
                .current()
                .ok_or_else(|| ShellError::NoSuchJob("current".to_string())),
            Some(s) => s
                .trim_start_matches('%')
                .parse::<usize>()
                .ok()
                .filter(|&id| self.get(id).is_some())
                .ok_or_else(|| ShellError::NoSuchJob(s.to_string())),
        }
    }

    /// PID の状態変化を所属ジョブに反映し、そのジョブの ID を返す。
    pub fn record(&mut self, pid: pid_t, event: ChildEvent) -> Option<usize> {
        self.jobs
            .iter_mut()
            .find_map(|j| if j.apply(pid, event) { Some(j.id) } else { None })
    }

    /// ID 順のイテレータ。
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ── フォアグラウンド待機 ─────────────────────────────────────────────

/// フォアグラウンド待機の結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundOutcome {
    /// グループ全員が終了した。引数は最終ステージの終了ステータス。
    Exited(i32),
    /// いずれかのメンバーが停止した。
    Stopped,
}

/// `waitpid(-pgid, WUNTRACED)` をループし、グループ全員の終了か、いずれかの停止まで待つ。
///
/// `processes` は結果に合わせて更新される。ジョブテーブルに登録できなかった
/// パイプラインも、呼び出し側が持つプロセス列でそのまま待機できる。
pub fn wait_for_group(pgid: pid_t, processes: &mut [JobProcess]) -> ForegroundOutcome {
    loop {
        let mut raw: i32 = 0;
        let pid = unsafe { libc::waitpid(-pgid, &mut raw, libc::WUNTRACED) };
        if pid < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // ECHILD: 残りのメンバーは既に回収されている
            debug!(pgid, error = %err, "group has no more children");
            for p in processes.iter_mut().filter(|p| !p.is_done()) {
                p.state = ProcState::Done(0);
            }
            break;
        }

        if let (Some(event), Some(p)) = (
            ChildEvent::from_raw(raw),
            processes.iter_mut().find(|p| p.pid == pid),
        ) {
            p.apply(event);
        }

        match aggregate(processes) {
            JobStatus::Stopped => return ForegroundOutcome::Stopped,
            JobStatus::Done => break,
            JobStatus::Running => continue,
        }
    }
    ForegroundOutcome::Exited(last_status(processes))
}

/// 登録済みジョブをフォアグラウンドで待ち、結果をテーブルに反映する。
///
/// 端末の受け渡しは呼び出し側が [`Terminal::hand_to`] のガードで行う。
/// - 停止 → Stopped にして端末モードを保存し、通知を出す。戻り値は 148
/// - 終了 → ジョブを削除する。戻り値は最終ステージの終了ステータス
pub fn wait_in_foreground(jobs: &mut JobTable, terminal: &Terminal, id: usize) -> i32 {
    let job = match jobs.get_mut(id) {
        Some(job) => job,
        None => return 1,
    };
    let pgid = job.pgid;
    match wait_for_group(pgid, &mut job.processes) {
        ForegroundOutcome::Stopped => {
            job.status = JobStatus::Stopped;
            job.tmodes = terminal.snapshot();
            eprintln!("\n[{}]+  Stopped   {}", job.id, job.command);
            STOPPED_STATUS
        }
        ForegroundOutcome::Exited(status) => {
            jobs.remove_by_pgid(pgid);
            status
        }
    }
}

// ── reap ────────────────────────────────────────────────────────────

/// 状態が変化した子プロセスをブロックせずにすべて回収する。
///
/// `waitpid(-1, WNOHANG | WUNTRACED | WCONTINUED)` を回収できるものがなくなるまで繰り返す。
pub fn collect_events() -> Vec<(pid_t, ChildEvent)> {
    let mut events = Vec::new();
    loop {
        let mut raw: i32 = 0;
        let pid = unsafe {
            libc::waitpid(
                -1,
                &mut raw,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };
        if pid < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if pid <= 0 {
            break;
        }
        if let Some(event) = ChildEvent::from_raw(raw) {
            events.push((pid, event));
        }
    }
    events
}

/// 回収した状態変化をジョブテーブルに反映し、通知を `out` に書く。
///
/// - 全員終了 → `[N]   Done   command` を出してテーブルから削除
/// - Running から停止 → `[N]+  Stopped   command`
/// - 再開 → Running に戻す（通知なし）
pub fn apply_events<I>(jobs: &mut JobTable, events: I, out: &mut dyn Write)
where
    I: IntoIterator<Item = (pid_t, ChildEvent)>,
{
    for (pid, event) in events {
        let before = jobs
            .iter()
            .find(|j| j.processes.iter().any(|p| p.pid == pid))
            .map(|j| j.status);
        let id = match jobs.record(pid, event) {
            Some(id) => id,
            None => {
                debug!(pid, ?event, "state change for untracked child");
                continue;
            }
        };
        let job = match jobs.get(id) {
            Some(job) => job,
            None => continue,
        };
        debug!(id, pid, ?event, status = %job.status, "job updated");
        match (before, job.status) {
            (_, JobStatus::Done) => {
                let _ = writeln!(out, "[{}]   Done   {}", job.id, job.command);
                let pgid = job.pgid;
                jobs.remove_by_pgid(pgid);
            }
            (Some(JobStatus::Running), JobStatus::Stopped) => {
                let _ = writeln!(out, "[{}]+  Stopped   {}", job.id, job.command);
            }
            _ => {}
        }
    }
}

/// SIGCHLD 通知後にメインループから呼ばれる reap 本体。
pub fn reap(jobs: &mut JobTable, out: &mut dyn Write) {
    let events = collect_events();
    apply_events(jobs, events, out);
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(pids: &[&[pid_t]]) -> JobTable {
        let mut t = JobTable::new(8);
        for (i, group) in pids.iter().enumerate() {
            t.add(group[0], &format!("job{}", i + 1), group).unwrap();
        }
        t
    }

    #[test]
    fn ids_start_at_one_and_never_reuse() {
        let mut t = JobTable::new(8);
        assert_eq!(t.add(100, "a", &[100]).unwrap(), 1);
        assert_eq!(t.add(200, "b", &[200]).unwrap(), 2);
        t.remove_by_pgid(100);
        t.remove_by_pgid(200);
        assert!(t.is_empty());
        assert_eq!(t.add(300, "c", &[300]).unwrap(), 3);
    }

    #[test]
    fn new_job_is_running_without_tmodes() {
        let t = table_with(&[&[10, 11]]);
        let job = t.get(1).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.tmodes.is_none());
        assert_eq!(job.processes.len(), 2);
    }

    #[test]
    fn full_table_refuses_without_consuming_id() {
        let mut t = JobTable::new(1);
        t.add(10, "a", &[10]).unwrap();
        let err = t.add(20, "b", &[20]).unwrap_err();
        assert!(matches!(err, ShellError::JobTableFull { capacity: 1, pgid: 20 }));
        assert_eq!(t.len(), 1);
        t.remove_by_pgid(10);
        assert_eq!(t.add(30, "c", &[30]).unwrap(), 2);
    }

    #[test]
    fn one_job_per_pgid() {
        let mut t = JobTable::new(8);
        t.add(10, "a", &[10]).unwrap();
        t.add(10, "b", &[10]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.find_by_pgid(10).unwrap().command, "b");
    }

    #[test]
    fn lookup_by_id_and_pgid() {
        let t = table_with(&[&[10], &[20]]);
        assert_eq!(t.get(2).unwrap().pgid, 20);
        assert_eq!(t.find_by_pgid(10).unwrap().id, 1);
        assert!(t.get(3).is_none());
        assert!(t.find_by_pgid(30).is_none());
    }

    #[test]
    fn set_status_by_pgid() {
        let mut t = table_with(&[&[10]]);
        assert!(t.set_status(10, JobStatus::Stopped));
        assert_eq!(t.get(1).unwrap().status, JobStatus::Stopped);
        assert!(!t.set_status(99, JobStatus::Running));
    }

    #[test]
    fn resolve_job_spec() {
        let t = table_with(&[&[10], &[20]]);
        assert_eq!(t.resolve(Some("1")).unwrap(), 1);
        assert_eq!(t.resolve(Some("%2")).unwrap(), 2);
        assert_eq!(t.resolve(None).unwrap(), 2);
        assert!(matches!(t.resolve(Some("7")), Err(ShellError::NoSuchJob(_))));
        assert!(matches!(t.resolve(Some("x")), Err(ShellError::NoSuchJob(_))));
        assert!(JobTable::new(4).resolve(None).is_err());
    }

    #[test]
    fn stop_then_continue_keeps_single_entry() {
        let mut t = table_with(&[&[10, 11, 12]]);
        let mut out = Vec::new();
        apply_events(&mut t, [(11, ChildEvent::Stopped(libc::SIGTSTP))], &mut out);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(1).unwrap().status, JobStatus::Stopped);
        assert_eq!(String::from_utf8(out).unwrap(), "[1]+  Stopped   job1\n");

        let mut out = Vec::new();
        apply_events(&mut t, [(11, ChildEvent::Continued)], &mut out);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(1).unwrap().status, JobStatus::Running);
        assert!(out.is_empty());
    }

    #[test]
    fn done_only_when_every_member_exits() {
        let mut t = table_with(&[&[10, 11]]);
        let mut out = Vec::new();
        apply_events(&mut t, [(10, ChildEvent::Exited(0))], &mut out);
        assert_eq!(t.len(), 1);
        assert!(out.is_empty());

        apply_events(&mut t, [(11, ChildEvent::Signaled(libc::SIGTERM))], &mut out);
        assert!(t.is_empty());
        assert_eq!(String::from_utf8(out).unwrap(), "[1]   Done   job1\n");
    }

    #[test]
    fn untracked_pid_is_ignored() {
        let mut t = table_with(&[&[10]]);
        let mut out = Vec::new();
        apply_events(&mut t, [(999, ChildEvent::Exited(0))], &mut out);
        assert_eq!(t.len(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn mark_continued_clears_stopped_members() {
        let mut t = table_with(&[&[10, 11]]);
        t.record(10, ChildEvent::Stopped(libc::SIGTSTP));
        t.record(11, ChildEvent::Exited(0));
        let job = t.get_mut(1).unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        job.mark_continued();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.processes[0].state, ProcState::Running);
        assert_eq!(job.processes[1].state, ProcState::Done(0));
    }

    #[test]
    fn aggregate_priority() {
        let mut procs = vec![JobProcess::new(1), JobProcess::new(2)];
        assert_eq!(aggregate(&procs), JobStatus::Running);
        procs[0].apply(ChildEvent::Exited(0));
        procs[1].apply(ChildEvent::Stopped(libc::SIGTSTP));
        assert_eq!(aggregate(&procs), JobStatus::Stopped);
        procs[1].apply(ChildEvent::Signaled(libc::SIGKILL));
        assert_eq!(aggregate(&procs), JobStatus::Done);
        assert_eq!(last_status(&procs), 128 + libc::SIGKILL);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn classify_raw_status() {
        assert_eq!(ChildEvent::from_raw(3 << 8), Some(ChildEvent::Exited(3)));
        assert_eq!(ChildEvent::from_raw(libc::SIGKILL), Some(ChildEvent::Signaled(libc::SIGKILL)));
        assert_eq!(
            ChildEvent::from_raw((libc::SIGTSTP << 8) | 0x7f),
            Some(ChildEvent::Stopped(libc::SIGTSTP))
        );
        assert_eq!(ChildEvent::from_raw(0xffff), Some(ChildEvent::Continued));
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::Running.to_string(), "Running");
        assert_eq!(JobStatus::Stopped.to_string(), "Stopped");
        assert_eq!(JobStatus::Done.to_string(), "Done");
    }
}
