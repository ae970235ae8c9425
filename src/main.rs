//! hopsh: ジョブ制御付きの対話シェル
//!
//! REPL ループ: reap → プロンプト表示 → 行入力 → 履歴追加 → 実行 → ループ
//!
//! 終了ステータス: 入力終端なら 0、`exit [N]` なら N、
//! 起動時にプロセスグループや端末を確保できなければ 1。

use std::io;
use std::process;

use tracing::debug;
use tracing_subscriber::EnvFilter;

use hopsh::config::Config;
use hopsh::editor::{LineEditor, LineSource, StdinLines};
use hopsh::prompt;
use hopsh::shell::Shell;
use hopsh::terminal::Terminal;

/// `HOPSH_LOG` でフィルタを指定する。未設定ならログは出さない。
fn init_tracing() {
    let filter = EnvFilter::try_from_env("HOPSH_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> i32 {
    let terminal = match Terminal::acquire(libc::STDIN_FILENO) {
        Ok(terminal) => terminal,
        Err(e) => {
            eprintln!("hopsh: {}", e);
            return 1;
        }
    };
    let interactive = terminal.is_interactive();
    let mut shell = Shell::new(Config::from_env(), terminal);
    debug!(interactive, home = %shell.home_dir.display(), "shell started");

    let mut source: Box<dyn LineSource> = if interactive {
        Box::new(LineEditor::default())
    } else {
        Box::new(StdinLines::new(io::stdin().lock()))
    };

    loop {
        // プロンプト前にバックグラウンドジョブを reap し、完了通知を出力
        shell.reap_if_pending();

        let prompt = if interactive {
            prompt::build(&shell.home_dir)
        } else {
            String::new()
        };
        let line = match source.read_line(&prompt, &mut shell.history) {
            Some(line) => line,
            None => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        if interactive {
            shell.history.add(&line);
        }

        shell.run_line(&line);
        if shell.should_exit {
            return shell.last_status;
        }
    }
    0
}

fn main() {
    init_tracing();
    process::exit(run());
}
