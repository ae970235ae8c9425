//! エイリアステーブルと永続化。
//!
//! ファイル形式は 1 行 1 エントリの `alias name="value"`。
//! 定義のたびにテーブル全体を書き出す。

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::ShellError;

/// 展開の最大段数。相互参照するエイリアスの無限展開を止める。
const MAX_EXPANSION_DEPTH: usize = 16;

/// 登録順を保つ固定容量のエイリアステーブル。
pub struct AliasTable {
    entries: Vec<(String, String)>,
    capacity: usize,
    path: Option<PathBuf>,
}

/// 値を囲むクォートを 1 組だけ外す。
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// `name=value` を分解する。値のクォートは外す。`=` がなければ `None`。
pub fn split_definition(def: &str) -> Option<(&str, &str)> {
    let (name, value) = def.split_once('=')?;
    Some((name, strip_quotes(value)))
}

impl AliasTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            path: None,
        }
    }

    /// `path` から読み込んだテーブルを作る。以後の定義は同じファイルに保存される。
    pub fn open(path: &Path, capacity: usize) -> Self {
        let mut table = Self::new(capacity);
        if let Err(e) = table.load(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to load aliases");
            }
        }
        table.path = Some(path.to_path_buf());
        table
    }

    fn load(&mut self, path: &Path) -> io::Result<()> {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let def = match line.trim_end_matches('\r').strip_prefix("alias ") {
                Some(def) => def,
                None => continue,
            };
            if let Some((name, value)) = split_definition(def) {
                if let Err(e) = self.insert(name, value) {
                    warn!(name, error = %e, "alias skipped while loading");
                }
            }
        }
        Ok(())
    }

    /// テーブル全体をファイルに書き出す。
    pub fn save(&self) -> io::Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let mut w = BufWriter::new(fs::File::create(path)?);
        for (name, value) in &self.entries {
            writeln!(w, "alias {}=\"{}\"", name, value)?;
        }
        w.flush()
    }

    fn insert(&mut self, name: &str, value: &str) -> Result<(), ShellError> {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(ShellError::AliasTableFull {
                capacity: self.capacity,
            });
        }
        self.entries.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// エイリアスを定義（または上書き）して保存する。
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ShellError> {
        self.insert(name, value)?;
        self.save()?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// 登録順のイテレータ。
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 行の最初の単語をエイリアスで置き換える。
    ///
    /// 置き換え後の最初の単語が別のエイリアスなら再帰的に展開する。
    /// 一度展開した名前が再び現れたら止める（`ls='ls -a'` や相互参照への対策）。
    pub fn expand<'a>(&self, line: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(line);
        let mut seen: Vec<String> = Vec::new();

        while seen.len() < MAX_EXPANSION_DEPTH {
            let trimmed = current.trim_start();
            let word_end = trimmed
                .find(|c: char| c.is_whitespace() || "|&;<>".contains(c))
                .unwrap_or(trimmed.len());
            let first = &trimmed[..word_end];
            if first.is_empty() || seen.iter().any(|s| s == first) {
                break;
            }
            let value = match self.get(first) {
                Some(v) => v,
                None => break,
            };
            let next = format!("{}{}", value, &trimmed[word_end..]);
            seen.push(first.to_string());
            current = Cow::Owned(next);
        }
        current
    }
}
