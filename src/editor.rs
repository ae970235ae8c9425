//! 行入力。
//!
//! REPL ループは [`LineSource`] だけを見る。
//!
//! | 実装 | 入力元 | 動作 |
//! |------|--------|------|
//! | [`LineEditor`] | 端末 | raw モードで 1 キーずつ読み、行を再描画する |
//! | [`StdinLines`] | パイプ・ファイル | `BufRead` から 1 行ずつ読む。プロンプトなし |
//!
//! raw モードは [`LineEditor::read_line`] の間だけ有効で、抜けるときに
//! `RawGuard` の Drop で元の端末設定に戻る。コマンドの実行中は cooked モードのまま。
//!
//! キー操作:
//!
//! | キー | 動作 |
//! |------|------|
//! | ← → / Home End (Ctrl-A Ctrl-E) | カーソル移動 |
//! | Backspace / Delete | 1 文字削除 |
//! | ↑ ↓ | 履歴の呼び出し |
//! | Ctrl-K / Ctrl-U | カーソルから行末 / 行頭からカーソルまで削除 |
//! | Ctrl-C | 入力中の行を捨てて新しいプロンプト |
//! | Ctrl-D | 空行なら入力終了 |

use std::io::{self, BufRead};
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::error::check;
use crate::history::History;

/// 1 行ずつ入力を返すもの。`None` は入力の終わり。
pub trait LineSource {
    fn read_line(&mut self, prompt: &str, history: &mut History) -> Option<String>;
}

// ── raw モード ──────────────────────────────────────────────────────

/// raw モードの間だけ生存するガード。
///
/// 出力側の `OPOST` は残すので `\n` は端末で `\r\n` になる。
/// `ISIG` を落とすため Ctrl-C / Ctrl-Z はシグナルではなくキーとして届く。
struct RawGuard {
    fd: RawFd,
    saved: libc::termios,
}

impl RawGuard {
    fn enter(fd: RawFd) -> io::Result<Self> {
        let mut saved = MaybeUninit::<libc::termios>::uninit();
        check(unsafe { libc::tcgetattr(fd, saved.as_mut_ptr()) })?;
        // SAFETY: tcgetattr が成功したので初期化済み
        let saved = unsafe { saved.assume_init() };

        let mut raw = saved;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ISIG | libc::IEXTEN);
        raw.c_iflag &= !(libc::ICRNL | libc::IXON | libc::BRKINT | libc::INPCK | libc::ISTRIP);
        raw.c_cflag |= libc::CS8;
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        check(unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) })?;
        Ok(Self { fd, saved })
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.saved);
        }
    }
}

// ── キーの解読 ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Insert(char),
    Submit,
    Erase,
    EraseForward,
    Left,
    Right,
    LineStart,
    LineEnd,
    Older,
    Newer,
    KillToEnd,
    KillToStart,
    Interrupt,
    /// Ctrl-D
    EndOfInput,
    /// 入力元が閉じた。
    Closed,
    Ignored,
}

/// 先頭バイトと後続バイトの取り出し口からキーを 1 つ組み立てる。
///
/// `more(wait)` は次のバイトを返す。`wait` が true のときは ESC 単独かどうかの
/// 判定中で、すぐに届かなければ `None` を返してよい。
fn decode(first: u8, mut more: impl FnMut(bool) -> Option<u8>) -> Key {
    match first {
        b'\r' | b'\n' => Key::Submit,
        0x7f | 0x08 => Key::Erase,
        0x01 => Key::LineStart,
        0x03 => Key::Interrupt,
        0x04 => Key::EndOfInput,
        0x05 => Key::LineEnd,
        0x0b => Key::KillToEnd,
        0x15 => Key::KillToStart,
        0x1b => decode_escape(&mut more),
        0x20..=0x7e => Key::Insert(first as char),
        _ => decode_utf8(first, &mut more),
    }
}

/// `ESC [ X` と `ESC [ n ~` の形だけを解釈する。
fn decode_escape(more: &mut impl FnMut(bool) -> Option<u8>) -> Key {
    if more(true) != Some(b'[') {
        return Key::Ignored;
    }
    let key = match more(false) {
        Some(b'A') => return Key::Older,
        Some(b'B') => return Key::Newer,
        Some(b'C') => return Key::Right,
        Some(b'D') => return Key::Left,
        Some(b'H') => return Key::LineStart,
        Some(b'F') => return Key::LineEnd,
        Some(b'1' | b'7') => Key::LineStart,
        Some(b'4' | b'8') => Key::LineEnd,
        Some(b'3') => Key::EraseForward,
        _ => return Key::Ignored,
    };
    if more(false) == Some(b'~') {
        key
    } else {
        Key::Ignored
    }
}

fn decode_utf8(first: u8, more: &mut impl FnMut(bool) -> Option<u8>) -> Key {
    let len = match first.leading_ones() {
        2 => 2,
        3 => 3,
        4 => 4,
        _ => return Key::Ignored,
    };
    let mut bytes = vec![first];
    for _ in 1..len {
        match more(false) {
            Some(b) => bytes.push(b),
            None => return Key::Ignored,
        }
    }
    std::str::from_utf8(&bytes)
        .ok()
        .and_then(|s| s.chars().next())
        .map_or(Key::Ignored, Key::Insert)
}

/// `fd` から 1 バイト読む。`timeout_ms` を与えると、その間に届かなければ `None`。
fn read_byte(fd: RawFd, timeout_ms: Option<i32>) -> Option<u8> {
    if let Some(ms) = timeout_ms {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, ms) } <= 0 {
            return None;
        }
    }
    let mut byte = 0u8;
    loop {
        let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
        match n {
            1 => return Some(byte),
            n if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted => {}
            _ => return None,
        }
    }
}

/// 端末から次のキーを読む。ESC の後続は 50ms だけ待つ。
fn next_key(fd: RawFd) -> Key {
    match read_byte(fd, None) {
        Some(first) => decode(first, |wait| read_byte(fd, wait.then_some(50))),
        None => Key::Closed,
    }
}

// ── 編集バッファ ────────────────────────────────────────────────────

/// 入力中の行とカーソル。カーソルはバイトオフセットで、常に文字境界にある。
#[derive(Debug, Default)]
struct LineBuffer {
    text: String,
    cursor: usize,
}

impl LineBuffer {
    fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }

    /// 内容を置き換えてカーソルを行末に置く。
    fn replace(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
        self.cursor = self.text.len();
    }

    fn insert(&mut self, ch: char) {
        self.text.insert(self.cursor, ch);
        self.cursor += ch.len_utf8();
    }

    fn char_start_before(&self) -> Option<usize> {
        self.text[..self.cursor].char_indices().last().map(|(i, _)| i)
    }

    fn erase(&mut self) {
        if let Some(start) = self.char_start_before() {
            self.text.remove(start);
            self.cursor = start;
        }
    }

    fn erase_forward(&mut self) {
        if self.cursor < self.text.len() {
            self.text.remove(self.cursor);
        }
    }

    fn left(&mut self) {
        if let Some(start) = self.char_start_before() {
            self.cursor = start;
        }
    }

    fn right(&mut self) {
        if let Some(ch) = self.text[self.cursor..].chars().next() {
            self.cursor += ch.len_utf8();
        }
    }

    fn kill_to_end(&mut self) {
        self.text.truncate(self.cursor);
    }

    fn kill_to_start(&mut self) {
        self.text.replace_range(..self.cursor, "");
        self.cursor = 0;
    }

    /// カーソルより右にある文字数。再描画でカーソルを戻す量。
    fn chars_after_cursor(&self) -> usize {
        self.text[self.cursor..].chars().count()
    }
}

/// 行頭に戻ってプロンプトと入力を描き、行末を消してカーソル位置へ戻るシーケンス。
fn render(prompt: &str, line: &LineBuffer) -> String {
    let mut out = format!("\r{}{}\x1b[K", prompt, line.text);
    let back = line.chars_after_cursor();
    if back > 0 {
        out.push_str(&format!("\x1b[{}D", back));
    }
    out
}

/// stdout のバッファを通さずに書く。描画が 1 回の `write(2)` に収まるようにする。
fn write_raw(s: &str) {
    let mut rest = s.as_bytes();
    while !rest.is_empty() {
        let n = unsafe { libc::write(libc::STDOUT_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if n <= 0 {
            break;
        }
        rest = &rest[n as usize..];
    }
}

// ── LineEditor ──────────────────────────────────────────────────────

/// 対話モードの行エディタ。
pub struct LineEditor {
    fd: RawFd,
    line: LineBuffer,
}

impl LineEditor {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            line: LineBuffer::default(),
        }
    }

    /// 1 キー分の編集を適用する。行が確定したら `Some(結果)` を返す。
    fn apply(&mut self, key: Key, history: &mut History) -> Option<Option<String>> {
        match key {
            Key::Submit => {
                history.end_recall();
                return Some(Some(std::mem::take(&mut self.line.text)));
            }
            Key::EndOfInput if self.line.text.is_empty() => return Some(None),
            Key::Closed => {
                let text = std::mem::take(&mut self.line.text);
                return Some((!text.is_empty()).then_some(text));
            }
            Key::Interrupt => {
                write_raw("^C\n");
                self.line.clear();
                history.end_recall();
            }
            Key::Insert(ch) => self.line.insert(ch),
            Key::Erase => self.line.erase(),
            Key::EraseForward => self.line.erase_forward(),
            Key::Left => self.line.left(),
            Key::Right => self.line.right(),
            Key::LineStart => self.line.cursor = 0,
            Key::LineEnd => self.line.cursor = self.line.text.len(),
            Key::KillToEnd => self.line.kill_to_end(),
            Key::KillToStart => self.line.kill_to_start(),
            Key::Older => {
                let current = self.line.text.clone();
                if let Some(entry) = history.older(&current) {
                    self.line.replace(entry);
                }
            }
            Key::Newer => {
                if let Some(entry) = history.newer() {
                    self.line.replace(entry);
                }
            }
            Key::EndOfInput | Key::Ignored => {}
        }
        None
    }
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new(libc::STDIN_FILENO)
    }
}

impl LineSource for LineEditor {
    /// Enter で `Some(line)`。空行での Ctrl-D と入力元の終端は `None`。
    fn read_line(&mut self, prompt: &str, history: &mut History) -> Option<String> {
        self.line.clear();
        history.end_recall();

        let _raw = match RawGuard::enter(self.fd) {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!(error = %e, "raw mode unavailable");
                None
            }
        };
        write_raw(&render(prompt, &self.line));

        loop {
            let key = next_key(self.fd);
            if let Some(done) = self.apply(key, history) {
                write_raw("\n");
                return done;
            }
            write_raw(&render(prompt, &self.line));
        }
    }
}

// ── StdinLines ──────────────────────────────────────────────────────

/// 端末でない入力から 1 行ずつ読む。
pub struct StdinLines<R> {
    reader: R,
}

impl<R: BufRead> StdinLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> LineSource for StdinLines<R> {
    fn read_line(&mut self, _prompt: &str, _history: &mut History) -> Option<String> {
        let mut raw = String::new();
        loop {
            match self.reader.read_line(&mut raw) {
                Ok(0) => return None,
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stdin read failed");
                    return None;
                }
            }
        }
        let line = raw.strip_suffix('\n').unwrap_or(&raw);
        Some(line.strip_suffix('\r').unwrap_or(line).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;

    fn keys(bytes: &[u8]) -> Vec<Key> {
        let mut input: VecDeque<u8> = bytes.iter().copied().collect();
        let mut out = Vec::new();
        while let Some(first) = input.pop_front() {
            out.push(decode(first, |_| input.pop_front()));
        }
        out
    }

    fn buffer(text: &str, cursor: usize) -> LineBuffer {
        LineBuffer {
            text: text.to_string(),
            cursor,
        }
    }

    #[test]
    fn decodes_control_and_printable_bytes() {
        assert_eq!(
            keys(b"a\r\x7f\x03\x04\x0b\x15\x01\x05"),
            [
                Key::Insert('a'),
                Key::Submit,
                Key::Erase,
                Key::Interrupt,
                Key::EndOfInput,
                Key::KillToEnd,
                Key::KillToStart,
                Key::LineStart,
                Key::LineEnd,
            ]
        );
    }

    #[test]
    fn decodes_escape_sequences() {
        assert_eq!(
            keys(b"\x1b[A\x1b[B\x1b[C\x1b[D\x1b[3~\x1b[H\x1b[4~"),
            [
                Key::Older,
                Key::Newer,
                Key::Right,
                Key::Left,
                Key::EraseForward,
                Key::LineStart,
                Key::LineEnd,
            ]
        );
        // ESC 単独
        assert_eq!(keys(b"\x1b"), [Key::Ignored]);
        assert_eq!(keys(b"\x1b[3x"), [Key::Ignored]);
    }

    #[test]
    fn decodes_multibyte_characters() {
        assert_eq!(keys("é日".as_bytes()), [Key::Insert('é'), Key::Insert('日')]);
        assert_eq!(keys(&[0xe6, 0x97]), [Key::Ignored]);
    }

    #[test]
    fn buffer_edits_respect_char_boundaries() {
        let mut b = LineBuffer::default();
        for ch in "hop 日本".chars() {
            b.insert(ch);
        }
        b.left();
        assert_eq!(b.chars_after_cursor(), 1);
        b.erase();
        assert_eq!(b.text, "hop 本");
        b.erase_forward();
        assert_eq!(b.text, "hop ");
        b.right();
        assert_eq!(b.cursor, b.text.len());
    }

    #[test]
    fn buffer_kills() {
        let mut b = buffer("reveal -la", 6);
        b.kill_to_end();
        assert_eq!(b.text, "reveal");
        let mut b = buffer("reveal -la", 7);
        b.kill_to_start();
        assert_eq!((b.text.as_str(), b.cursor), ("-la", 0));
    }

    #[test]
    fn erase_at_start_is_noop() {
        let mut b = buffer("ab", 0);
        b.erase();
        b.left();
        assert_eq!((b.text.as_str(), b.cursor), ("ab", 0));
    }

    #[test]
    fn render_moves_cursor_back() {
        assert_eq!(render("> ", &buffer("ab", 2)), "\r> ab\x1b[K");
        assert_eq!(render("> ", &buffer("abc", 1)), "\r> abc\x1b[K\x1b[2D");
    }

    #[test]
    fn editor_recalls_history_and_submits() {
        let mut history = History::in_memory(10);
        history.add("activities");
        history.add("hop ..");
        let mut ed = LineEditor::new(-1);

        assert_eq!(ed.apply(Key::Insert('x'), &mut history), None);
        ed.apply(Key::Older, &mut history);
        assert_eq!(ed.line.text, "hop ..");
        ed.apply(Key::Older, &mut history);
        assert_eq!(ed.line.text, "activities");
        ed.apply(Key::Newer, &mut history);
        ed.apply(Key::Newer, &mut history);
        assert_eq!(ed.line.text, "x");

        assert_eq!(ed.apply(Key::Submit, &mut history), Some(Some("x".into())));
        assert!(!history.is_recalling());
    }

    #[test]
    fn ctrl_d_ends_input_only_on_empty_line() {
        let mut history = History::in_memory(10);
        let mut ed = LineEditor::new(-1);
        ed.apply(Key::Insert('a'), &mut history);
        assert_eq!(ed.apply(Key::EndOfInput, &mut history), None);
        ed.line.clear();
        assert_eq!(ed.apply(Key::EndOfInput, &mut history), Some(None));
        ed.apply(Key::Insert('z'), &mut history);
        assert_eq!(ed.apply(Key::Closed, &mut history), Some(Some("z".into())));
    }

    #[test]
    fn read_byte_from_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(unsafe { libc::write(fds[1], b"\x1b[A".as_ptr().cast(), 3) }, 3);
        assert_eq!(next_key(fds[0]), Key::Older);
        unsafe {
            libc::close(fds[1]);
        }
        assert_eq!(next_key(fds[0]), Key::Closed);
        unsafe {
            libc::close(fds[0]);
        }
    }

    #[test]
    fn stdin_lines_strip_line_endings() {
        let mut history = History::in_memory(10);
        let mut src = StdinLines::new(Cursor::new("hop ..\r\nreveal\n\nlast"));
        let mut lines = Vec::new();
        while let Some(line) = src.read_line("", &mut history) {
            lines.push(line);
        }
        assert_eq!(lines, ["hop ..", "reveal", "", "last"]);
        assert!(history.is_empty());
    }
}
