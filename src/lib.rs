//! hopsh ライブラリ: バイナリ・テスト・ベンチマークからモジュールを公開する。
//!
//! バイナリ本体は `main.rs` の REPL ループ。
//! 入力行は パーサー → パイプライン → executor（ビルトイン判定・fork・ジョブ登録）と流れ、
//! 子プロセスの状態変化は SIGCHLD の通知フラグを経由してメインループで reap される。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`parser`] | トークナイザと再帰下降パーサー（パイプ、`;`、`&`、`<` / `>` / `>>`、クォート） |
//! | [`executor`] | パイプライン実行（ビルトイン判定、パイプ接続、プロセスグループ、フォアグラウンド待機） |
//! | [`spawn`] | 1 ステージ分の `fork` と子プロセス側のセットアップ |
//! | [`job`] | ジョブテーブル、状態遷移、reap |
//! | [`signals`] | SIGCHLD 通知フラグとシグナル設定 |
//! | [`terminal`] | 端末の所有権（`tcsetpgrp`）と termios の保存・復元 |
//! | [`builtins`] | ビルトイン（`hop`, `reveal`, `alias`, `log`, `ping`, `activities`, `fg`, `bg`, `exit`） |
//! | [`alias`] | エイリアステーブルと永続化 |
//! | [`history`] | コマンド履歴（永続化、↑↓ ナビゲーション） |
//! | [`editor`] | 行エディタ（raw モード）と非対話入力 |
//! | [`prompt`] | `<user@host:path> ` プロンプト |
//! | [`config`] | 容量とファイルの置き場所 |
//! | [`error`] | エラー型 |
//! | [`shell`] | セッション状態（ジョブ、端末、エイリアス、履歴、ディレクトリ） |

pub mod alias;
pub mod builtins;
pub mod config;
pub mod editor;
pub mod error;
pub mod executor;
pub mod history;
pub mod job;
pub mod parser;
pub mod prompt;
pub mod shell;
pub mod signals;
pub mod spawn;
pub mod terminal;
