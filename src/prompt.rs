//! プロンプト文字列 `<user@host:path> ` の組み立て。

use std::env;
use std::ffi::CStr;
use std::path::Path;

/// シェルのホーム以下のパスを `~` で短縮する。
///
/// 比較はパス要素単位なので `/home/a` は `/home/ab` の接頭辞として扱わない。
pub fn abbreviate(cwd: &Path, home: &Path) -> String {
    match cwd.strip_prefix(home) {
        Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
        Ok(rest) => format!("~/{}", rest.display()),
        Err(_) => cwd.display().to_string(),
    }
}

/// ログインユーザー名。パスワードデータベースにいなければ `$USER`、それもなければ `user`。
fn user_name() -> String {
    let pw = unsafe { libc::getpwuid(libc::getuid()) };
    if !pw.is_null() {
        let name = unsafe { CStr::from_ptr((*pw).pw_name) };
        return name.to_string_lossy().into_owned();
    }
    env::var("USER").unwrap_or_else(|_| "user".to_string())
}

fn host_name() -> String {
    let mut buf = [0 as libc::c_char; 256];
    if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } != 0 {
        return "localhost".to_string();
    }
    // 切り詰められた場合に備えて終端を保証する
    buf[buf.len() - 1] = 0;
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// 現在のプロンプト。カレントディレクトリが取得できなければ `?`。
pub fn build(home: &Path) -> String {
    let path = match env::current_dir() {
        Ok(cwd) => abbreviate(&cwd, home),
        Err(_) => "?".to_string(),
    };
    format!("<{}@{}:{}> ", user_name(), host_name(), path)
}
