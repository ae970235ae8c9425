//! ビルトインコマンドの実装。
//!
//! 名前 → ハンドラの静的テーブル [`BUILTINS`] で解決する。
//! executor は外部コマンドとして起動する前に [`is_builtin`] を確認する。
//!
//! | 名前 | 動作 |
//! |------|------|
//! | `hop` | ディレクトリ移動（`~`, `-` 対応） |
//! | `reveal` | ディレクトリ一覧（`-a`, `-l`） |
//! | `alias` | エイリアスの一覧・参照・定義 |
//! | `log` | ログファイルへの追記 |
//! | `ping` | ジョブのプロセスグループへシグナル送信 |
//! | `activities` | ジョブ一覧 |
//! | `fg` / `bg` | ジョブの再開 |
//! | `exit` | シェル終了 |
//!
//! パイプラインの子プロセス内でも同じハンドラが動く（[`run_forked`]）。
//! 子での変更は親のシェルには見えず、子は常にステータス 0 で終わる。

use std::env;
use std::ffi::CStr;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::alias;
use crate::error::check;
use crate::job::{self, JobStatus};
use crate::shell::Shell;

/// ビルトインのハンドラ。`out` は stdout（またはリダイレクト先）、診断は stderr に出す。
pub type Handler = fn(&mut Shell, &[&str], &mut dyn Write) -> i32;

/// 名前 → ハンドラの対応表。
pub const BUILTINS: &[(&str, Handler)] = &[
    ("hop", builtin_hop),
    ("reveal", builtin_reveal),
    ("alias", builtin_alias),
    ("log", builtin_log),
    ("ping", builtin_ping),
    ("activities", builtin_activities),
    ("fg", builtin_fg),
    ("bg", builtin_bg),
    ("exit", builtin_exit),
];

pub fn lookup(name: &str) -> Option<Handler> {
    BUILTINS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, handler)| *handler)
}

pub fn is_builtin(name: &str) -> bool {
    lookup(name).is_some()
}

/// ビルトインを実行する。`args[0]` がビルトインでなければ 127。
pub fn dispatch(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let name = match args.first() {
        Some(name) => *name,
        None => return 0,
    };
    match lookup(name) {
        Some(handler) => {
            debug!(builtin = name, argc = args.len(), "running builtin");
            handler(shell, args, out)
        }
        None => 127,
    }
}

/// パイプラインの子プロセス内でビルトインを実行する。
///
/// 戻り値は子の終了ステータスで、ハンドラの結果によらず 0。
pub fn run_forked(shell: &mut Shell, args: &[String]) -> i32 {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let status = dispatch(shell, &args, &mut out);
    let _ = out.flush();
    debug!(builtin = args.first().copied().unwrap_or(""), status, "forked builtin finished");
    0
}

/// `~` / `~/sub` をシェルのホームディレクトリで展開する。
fn expand_home(arg: &str, home: &Path) -> PathBuf {
    if arg == "~" {
        home.to_path_buf()
    } else if let Some(rest) = arg.strip_prefix("~/") {
        home.join(rest)
    } else {
        PathBuf::from(arg)
    }
}

// ── hop ────────────────────────────────────────────────────────────

/// `hop [dir|-|~]`: カレントディレクトリを変更する。
///
/// 引数省略と `~` はシェルの起動ディレクトリ、`-` は直前のディレクトリ（移動先を表示）。
fn builtin_hop(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let target = match args.get(1).copied() {
        None => shell.home_dir.clone(),
        Some("-") => match &shell.prev_dir {
            Some(prev) => {
                let _ = writeln!(out, "{}", prev.display());
                prev.clone()
            }
            None => {
                eprintln!("hop: OLDPWD not set");
                return 1;
            }
        },
        Some(arg) => expand_home(arg, &shell.home_dir),
    };

    let current = env::current_dir().ok();
    if let Err(e) = env::set_current_dir(&target) {
        eprintln!("hop: {}: {}", target.display(), e);
        return 1;
    }
    if current.is_some() {
        shell.prev_dir = current;
    }
    0
}

// ── reveal ─────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct RevealOptions {
    all: bool,
    long: bool,
}

/// フラグとパスを分離する。未知のフラグ文字はエラー。
fn parse_reveal_args<'a>(args: &[&'a str]) -> Result<(RevealOptions, Option<&'a str>), char> {
    let mut opts = RevealOptions::default();
    let mut path = None;
    for arg in args.iter().skip(1) {
        match arg.strip_prefix('-') {
            Some(flags) if !flags.is_empty() => {
                for c in flags.chars() {
                    match c {
                        'a' => opts.all = true,
                        'l' => opts.long = true,
                        other => return Err(other),
                    }
                }
            }
            _ => path = Some(*arg),
        }
    }
    Ok((opts, path))
}

/// `drwxr-xr-x` 形式のパーミッション文字列。
fn mode_string(mode: u32, is_dir: bool) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    let mut s = String::with_capacity(10);
    s.push(if is_dir { 'd' } else { '-' });
    for (bit, c) in BITS {
        s.push(if mode & bit != 0 { c } else { '-' });
    }
    s
}

/// `strftime` でローカル時刻を整形する。`fmt` は NUL 終端。
fn format_local_time(secs: i64, fmt: &[u8]) -> String {
    let t = secs as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    if unsafe { libc::localtime_r(&t, &mut tm) }.is_null() {
        return "?".to_string();
    }
    let mut buf = [0 as libc::c_char; 64];
    let n = unsafe {
        libc::strftime(
            buf.as_mut_ptr(),
            buf.len(),
            fmt.as_ptr() as *const libc::c_char,
            &tm,
        )
    };
    let bytes: Vec<u8> = buf[..n].iter().map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn owner_name(uid: u32) -> String {
    let pw = unsafe { libc::getpwuid(uid) };
    if pw.is_null() {
        return uid.to_string();
    }
    unsafe { CStr::from_ptr((*pw).pw_name) }
        .to_string_lossy()
        .into_owned()
}

fn group_name(gid: u32) -> String {
    let gr = unsafe { libc::getgrgid(gid) };
    if gr.is_null() {
        return gid.to_string();
    }
    unsafe { CStr::from_ptr((*gr).gr_name) }
        .to_string_lossy()
        .into_owned()
}

/// 1 エントリ分の詳細表示行。
fn long_entry(path: &Path, name: &str) -> io::Result<String> {
    let meta = fs::metadata(path)?;
    Ok(format!(
        "{} {:>2} {:<8} {:<8} {:>8} {} {}",
        mode_string(meta.mode(), meta.is_dir()),
        meta.nlink(),
        owner_name(meta.uid()),
        group_name(meta.gid()),
        meta.size(),
        format_local_time(meta.mtime(), b"%b %d %H:%M\0"),
        name
    ))
}

/// ディレクトリのエントリ名を辞書順で返す。`all` なら `.` と `..` を含む隠しエントリも返す。
fn list_dir(dir: &Path, all: bool) -> io::Result<Vec<String>> {
    let mut names: Vec<String> = if all {
        vec![".".to_string(), "..".to_string()]
    } else {
        Vec::new()
    };
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if all || !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// `reveal [-a] [-l] [path]`: ディレクトリの内容を辞書順で表示する。
fn builtin_reveal(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let (opts, path) = match parse_reveal_args(args) {
        Ok(parsed) => parsed,
        Err(c) => {
            eprintln!("reveal: invalid option -- '{}'", c);
            return 1;
        }
    };
    let target = expand_home(path.unwrap_or("."), &shell.home_dir);

    let meta = match fs::metadata(&target) {
        Ok(meta) => meta,
        Err(e) => {
            eprintln!("reveal: {}: {}", target.display(), e);
            return 1;
        }
    };

    if !meta.is_dir() {
        let shown = target.display().to_string();
        let line = if opts.long {
            long_entry(&target, &shown)
        } else {
            Ok(shown)
        };
        return match line {
            Ok(line) => {
                let _ = writeln!(out, "{}", line);
                0
            }
            Err(e) => {
                eprintln!("reveal: {}: {}", target.display(), e);
                1
            }
        };
    }

    let names = match list_dir(&target, opts.all) {
        Ok(names) => names,
        Err(e) => {
            eprintln!("reveal: {}: {}", target.display(), e);
            return 1;
        }
    };

    if !opts.long {
        if !names.is_empty() {
            let _ = writeln!(out, "{}", names.join("  "));
        }
        return 0;
    }

    let mut status = 0;
    for name in &names {
        match long_entry(&target.join(name), name) {
            Ok(line) => {
                let _ = writeln!(out, "{}", line);
            }
            Err(e) => {
                eprintln!("reveal: {}: {}", name, e);
                status = 1;
            }
        }
    }
    status
}

// ── alias ──────────────────────────────────────────────────────────

/// `alias` / `alias name` / `alias name=value`
fn builtin_alias(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    if args.len() < 2 {
        for (name, value) in shell.aliases.iter() {
            let _ = writeln!(out, "alias {}='{}'", name, value);
        }
        return 0;
    }

    let mut status = 0;
    for arg in &args[1..] {
        match alias::split_definition(arg) {
            Some(("", _)) => {
                eprintln!("alias: `{}': invalid alias name", arg);
                status = 1;
            }
            Some((name, value)) => {
                if let Err(e) = shell.aliases.set(name, value) {
                    eprintln!("alias: {}", e);
                    status = 1;
                }
            }
            None => match shell.aliases.get(arg) {
                Some(value) => {
                    let _ = writeln!(out, "alias {}='{}'", arg, value);
                }
                None => {
                    eprintln!("alias: {}: not found", arg);
                    status = 1;
                }
            },
        }
    }
    status
}

// ── log ────────────────────────────────────────────────────────────

/// `log message...`: `[時刻] message` をログファイルに追記する。
fn builtin_log(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    if args.len() < 2 {
        eprintln!("log: expected message to log");
        return 1;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let stamp = format_local_time(now, b"%a %b %e %H:%M:%S %Y\0");
    let path = &shell.config.log_file;

    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "[{}] {}", stamp, args[1..].join(" ")));
    match written {
        Ok(()) => {
            let _ = writeln!(out, "Message logged to {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("log: {}: {}", path.display(), e);
            1
        }
    }
}

// ── ジョブ制御 ──────────────────────────────────────────────────────

/// `ping <job_id> <signal>`: ジョブのプロセスグループにシグナルを送る。
fn builtin_ping(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    if args.len() < 3 {
        eprintln!("Usage: ping <job_id> <signal_number>");
        return 1;
    }
    let id = match shell.jobs.resolve(Some(args[1])) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("ping: {}", e);
            return 1;
        }
    };
    let sig = match args[2].parse::<i32>() {
        Ok(sig) if sig >= 0 => sig,
        _ => {
            eprintln!("ping: {}: invalid signal number", args[2]);
            return 1;
        }
    };
    let pgid = match shell.jobs.get(id) {
        Some(job) => job.pgid,
        None => return 1,
    };
    if let Err(e) = check(unsafe { libc::killpg(pgid, sig) }) {
        eprintln!("ping: {}", e);
        return 1;
    }
    let _ = writeln!(out, "Sent signal {} to job {} (pgid {})", sig, id, pgid);
    0
}

/// `activities`: ジョブを `[id] Status (pgid: N)\tcommand` 形式で一覧表示する。
fn builtin_activities(shell: &mut Shell, _args: &[&str], out: &mut dyn Write) -> i32 {
    for job in shell.jobs.iter() {
        let _ = writeln!(
            out,
            "[{}] {} (pgid: {})\t{}",
            job.id, job.status, job.pgid, job.command
        );
    }
    0
}

/// `fg [%N]`: ジョブをフォアグラウンドで再開し、停止か終了まで待つ。
///
/// 端末と保存済みの端末モードをジョブに渡してから SIGCONT を送る。
fn builtin_fg(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let id = match shell.jobs.resolve(args.get(1).copied()) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("fg: {}", e);
            return 1;
        }
    };
    let (pgid, tmodes) = match shell.jobs.get(id) {
        Some(job) => {
            let _ = writeln!(out, "{}", job.command);
            (job.pgid, job.tmodes)
        }
        None => return 1,
    };
    let _ = out.flush();

    let _guard = shell.terminal.hand_to(pgid, tmodes.as_ref());
    if let Err(e) = check(unsafe { libc::killpg(pgid, libc::SIGCONT) }) {
        eprintln!("fg: {}", e);
        return 1;
    }
    if let Some(job) = shell.jobs.get_mut(id) {
        job.mark_continued();
    }
    job::wait_in_foreground(&mut shell.jobs, &shell.terminal, id)
}

/// `bg [%N]`: 停止中のジョブをバックグラウンドで再開する。
fn builtin_bg(shell: &mut Shell, args: &[&str], out: &mut dyn Write) -> i32 {
    let id = match shell.jobs.resolve(args.get(1).copied()) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("bg: {}", e);
            return 1;
        }
    };
    let job = match shell.jobs.get_mut(id) {
        Some(job) => job,
        None => return 1,
    };
    if job.status == JobStatus::Running {
        eprintln!("bg: job {} already in background", id);
        return 1;
    }
    if let Err(e) = check(unsafe { libc::killpg(job.pgid, libc::SIGCONT) }) {
        eprintln!("bg: {}", e);
        return 1;
    }
    job.mark_continued();
    // `&` 付きで起動したジョブはテキストに既に `&` がある
    let marker = if job.command.ends_with('&') { "" } else { " &" };
    let _ = writeln!(out, "[{}] {}{}", id, job.command, marker);
    0
}

/// `exit [N]`: シェルを終了する。N 省略時は 0。
fn builtin_exit(shell: &mut Shell, args: &[&str], _out: &mut dyn Write) -> i32 {
    shell.should_exit = true;
    match args.get(1) {
        None => 0,
        Some(arg) => arg.parse::<i32>().unwrap_or_else(|_| {
            eprintln!("hopsh: exit: {}: numeric argument required", arg);
            2
        }),
    }
}
