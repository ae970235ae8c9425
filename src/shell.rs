//! シェルのセッション状態を保持するモジュール。
//!
//! ジョブテーブル、端末、エイリアス、履歴、ディレクトリ情報はすべて [`Shell`] が所有し、
//! executor・builtins・reap には参照として渡される。プロセス全体で共有される状態は
//! SIGCHLD の通知フラグ（[`signals`]）だけ。

use std::borrow::Cow;
use std::env;
use std::io;
use std::path::PathBuf;

use tracing::debug;

use crate::alias::AliasTable;
use crate::config::Config;
use crate::error::ShellError;
use crate::executor;
use crate::history::History;
use crate::job::{self, JobTable};
use crate::parser::{self, ParseError, Pipeline};
use crate::signals;
use crate::terminal::Terminal;

/// シェルの実行状態。REPL ループ全体で共有される。
pub struct Shell {
    /// ジョブテーブル。バックグラウンド/停止ジョブを管理する。
    pub jobs: JobTable,
    /// 制御端末とシェル自身のプロセスグループ。
    pub terminal: Terminal,
    pub aliases: AliasTable,
    pub history: History,
    pub config: Config,
    /// シェルを起動したディレクトリ。`hop ~` とプロンプトの `~` が指す。
    pub home_dir: PathBuf,
    /// `hop -` の移動先。
    pub prev_dir: Option<PathBuf>,
    /// 直前のパイプラインの終了ステータス。
    pub last_status: i32,
    /// `exit` ビルトインで true にセットされ、REPL ループを終了させる。
    pub should_exit: bool,
}

impl Shell {
    /// エイリアスと履歴をファイルから読み込んでシェルを作る。
    pub fn new(config: Config, terminal: Terminal) -> Self {
        let home_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            jobs: JobTable::new(config.max_jobs),
            aliases: AliasTable::open(&config.alias_file, config.max_aliases),
            history: History::open(&config.history_file, config.history_capacity),
            terminal,
            config,
            home_dir,
            prev_dir: None,
            last_status: 0,
            should_exit: false,
        }
    }

    /// 1 行を実行し、最後のパイプラインの終了ステータスを返す。
    ///
    /// 構文エラーなら行全体を破棄する。パイプラインの実行ごとに保留中の reap を行う。
    pub fn run_line(&mut self, line: &str) -> i32 {
        let pipelines = match self.parse_line(line) {
            Ok(pipelines) => pipelines,
            Err(e) => {
                let e = ShellError::from(e);
                eprintln!("hopsh: {}", e);
                self.last_status = e.exit_status();
                return self.last_status;
            }
        };
        debug!(count = pipelines.len(), line, "parsed line");

        for pipeline in &pipelines {
            self.last_status = executor::launch(self, pipeline);
            self.reap_if_pending();
            if self.should_exit {
                break;
            }
        }
        self.last_status
    }

    /// 行をパースし、パイプラインごとに先頭の単語をエイリアス展開する。
    ///
    /// 展開した結果はもう一度パースする。表示テキストは入力したままの文字列を残す。
    fn parse_line(&self, line: &str) -> Result<Vec<Pipeline>, ParseError> {
        let mut pipelines = Vec::new();
        for pipeline in parser::parse(line)? {
            let expanded = match self.aliases.expand(&pipeline.text) {
                Cow::Owned(expanded) => Some(expanded),
                Cow::Borrowed(_) => None,
            };
            match expanded {
                Some(expanded) => {
                    for mut p in parser::parse(&expanded)? {
                        p.text = pipeline.text.clone();
                        pipelines.push(p);
                    }
                }
                None => pipelines.push(pipeline),
            }
        }
        Ok(pipelines)
    }

    /// SIGCHLD の通知が保留中なら子プロセスを回収し、ジョブの状態変化を通知する。
    pub fn reap_if_pending(&mut self) {
        if signals::take_pending() {
            job::reap(&mut self.jobs, &mut io::stderr());
        }
    }
}
