//! コマンド履歴。
//!
//! 直近のコマンドを容量つきのリングで保持し、追加のたびにファイルへ書き出す。
//! 行エディタの ↑↓ で過去のコマンドを呼び出す。
//!
//! | 項目 | 内容 |
//! |------|------|
//! | ファイル | [`Config::history_file`](crate::config::Config::history_file)、1 行 1 コマンド |
//! | 容量 | 既定 50。超えたら古い順に捨てる。ファイルも常に容量以内 |
//! | 重複 | 直前と同じ行は追加しない |
//!
//! 呼び出し中の位置と、呼び出しを始める前の入力（下書き）は [`Recall`] が持つ。
//! 呼び出していない間は `None`。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// ↑↓ で履歴を辿っている間の状態。
#[derive(Debug)]
struct Recall {
    /// 表示中のエントリ。`entries.len()` なら下書きを表示している。
    index: usize,
    draft: String,
}

pub struct History {
    /// 古い順。
    entries: VecDeque<String>,
    capacity: usize,
    recall: Option<Recall>,
    /// `None` ならファイルに保存しない。
    path: Option<PathBuf>,
}

impl History {
    /// `path` の既存エントリを読み込む。ファイルがなければ空で始める。
    pub fn open(path: &Path, capacity: usize) -> Self {
        let mut history = Self::in_memory(capacity);
        if let Err(e) = history.load(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to load history");
            }
        }
        history.path = Some(path.to_path_buf());
        history
    }

    pub fn in_memory(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            recall: None,
            path: None,
        }
    }

    fn load(&mut self, path: &Path) -> io::Result<()> {
        for line in BufReader::new(File::open(path)?).lines() {
            self.push(&line?);
        }
        Ok(())
    }

    /// 空行と直前の重複を除いて末尾に積む。積んだら `true`。
    fn push(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || self.entries.back().map(String::as_str) == Some(line) {
            return false;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(line.to_owned());
        true
    }

    /// 入力された行を記録して保存する。保存の失敗はログに残すだけ。
    pub fn add(&mut self, line: &str) {
        self.recall = None;
        if self.push(line) {
            if let Err(e) = self.save() {
                warn!(error = %e, "failed to save history");
            }
        }
    }

    /// 全エントリでファイルを書き直す。
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut w = BufWriter::new(File::create(path)?);
        for entry in &self.entries {
            writeln!(w, "{}", entry)?;
        }
        w.flush()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// 呼び出しを終えて下書きを捨てる。行の読み取りを始めるときに呼ぶ。
    pub fn end_recall(&mut self) {
        self.recall = None;
    }

    pub fn is_recalling(&self) -> bool {
        self.recall.is_some()
    }

    /// ↑: 1 つ古いエントリ。呼び出しの開始時は `current` を下書きとして預かる。
    /// 最も古いエントリより前には進まず `None` を返す。
    pub fn older(&mut self, current: &str) -> Option<&str> {
        let len = self.entries.len();
        let recall = self.recall.get_or_insert_with(|| Recall {
            index: len,
            draft: current.to_owned(),
        });
        if recall.index == 0 {
            return None;
        }
        recall.index -= 1;
        self.entries.get(recall.index).map(String::as_str)
    }

    /// ↓: 1 つ新しいエントリ。最新を越えると下書きに戻る。
    pub fn newer(&mut self) -> Option<&str> {
        let len = self.entries.len();
        let recall = self.recall.as_mut()?;
        if recall.index >= len {
            return None;
        }
        recall.index += 1;
        if recall.index == len {
            Some(recall.draft.as_str())
        } else {
            self.entries.get(recall.index).map(String::as_str)
        }
    }
}
