//! トークナイザ + パーサー: 入力行からパイプライン列を構築する。
//!
//! 手書きトークナイザが入力を 1 トークンずつ遅延生成し（[`Tokenizer`]）、
//! ループベースの再帰下降パーサーが [`Pipeline`] の列に変換する。
//!
//! ## 文法
//!
//! ```text
//! sequence := pipeline (';' | '&') sequence?
//! pipeline := command ('|' pipeline)?
//! command  := (word | redirection)+
//! redirection := '<' word | '>' word | '>>' word
//! ```
//!
//! - クォート: シングル (`'...'`) / ダブル (`"..."`)。語頭のクォートは剥がして 1 ワードにする
//! - エスケープ・変数展開・glob は行わない
//! - 構文エラーは行全体を破棄する（部分的な AST は返さない）
//! - 各パイプラインは自分が消費したソース文字列（末尾の `&` を含み `;` を含まない）を保持し、
//!   ジョブテーブルの表示に使われる

use std::ops::Range;

use thiserror::Error;

// ── AST ─────────────────────────────────────────────────────────────

/// パイプラインの 1 ステージ。`args[0]` がプログラム名。
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SimpleCommand {
    pub args: Vec<String>,
    /// `<` で指定された入力ファイル。
    pub input: Option<String>,
    /// `>` / `>>` で指定された出力ファイル。
    pub output: Option<String>,
    /// `>>` のとき `true`（追記）。`>` なら切り詰め。
    pub append: bool,
}

impl SimpleCommand {
    /// プログラム名。パーサーが返すコマンドは必ず 1 つ以上の引数を持つ。
    pub fn program(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }
}

/// `|` で接続されたステージ列。
///
/// ステージ `i` の stdout はステージ `i + 1` の stdin に接続される。
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<SimpleCommand>,
    /// 末尾に `&` が指定された場合に `true`。
    pub background: bool,
    /// パーサーが消費したソース文字列そのもの。ジョブ表示用。
    pub text: String,
}

// ── Error ───────────────────────────────────────────────────────────

/// 構文エラー。発生した行は丸ごと破棄される。
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// クォートが閉じられていない。引数は開始クォート文字。
    #[error("unexpected EOF while looking for matching `{0}`")]
    UnterminatedQuote(char),
    /// リダイレクト演算子の後にファイル名がない。
    #[error("syntax error: expected filename after `{0}`")]
    MissingRedirectTarget(&'static str),
    /// 文法が受け付けないトークン（先頭の `|`、`;;`、`(` など）。
    #[error("syntax error near unexpected token `{0}`")]
    UnexpectedToken(String),
    /// `|` の後などでコマンドが空のまま入力が終わった。
    #[error("syntax error: missing command")]
    EmptyCommand,
}

// ── Tokenizer ───────────────────────────────────────────────────────

/// トークンの種別。
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Word,
    Pipe,        // |
    Ampersand,   // &
    Semicolon,   // ;
    RedirIn,     // <
    RedirOut,    // >
    RedirAppend, // >>
    Eof,
    /// 字句エラー。診断内容を保持する。
    Error(ParseError),
}

/// トークン。`text` は Word ならクォートを剥がした中身、それ以外は字句そのもの。
/// `span` は元の入力におけるバイト範囲（クォートを含む）。
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub span: Range<usize>,
}

/// ワードを終端させるバイト。
fn is_delimiter(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'\t' | b'\r' | b'\n' | b'|' | b'&' | b';' | b'<' | b'>' | b'(' | b')'
    )
}

/// 入力行を 1 トークンずつ生成する字句解析器。
///
/// 状態は入力位置だけなので、同じ行に対して新しい `Tokenizer` を作れば
/// 何度でも副作用なく先頭から読み直せる。
/// `Iterator` としては `Eof` か `Error` を 1 回返した時点で終了する。
pub struct Tokenizer<'a> {
    input: &'a str,
    pos: usize,
    finished: bool,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            finished: false,
        }
    }

    fn skip_whitespace(&mut self) {
        let bytes = self.input.as_bytes();
        while self.pos < bytes.len() && matches!(bytes[self.pos], b' ' | b'\t' | b'\r' | b'\n') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn make(&self, kind: TokenKind, start: usize) -> Token<'a> {
        Token {
            kind,
            text: &self.input[start..self.pos],
            span: start..self.pos,
        }
    }

    /// `open` の位置にあるクォートに対応する閉じクォートの位置を返す。
    fn closing_quote(&self, open: usize) -> Option<usize> {
        let quote = self.input.as_bytes()[open];
        self.input.as_bytes()[open + 1..]
            .iter()
            .position(|&b| b == quote)
            .map(|off| open + 1 + off)
    }

    /// 空白を読み飛ばし、字句を 1 つだけ読んで返す。入力末尾では常に `Eof`。
    pub fn scan_token(&mut self) -> Token<'a> {
        self.skip_whitespace();
        let start = self.pos;
        let ch = match self.peek() {
            Some(c) => c,
            None => return self.make(TokenKind::Eof, start),
        };

        match ch {
            b'|' => {
                self.pos += 1;
                self.make(TokenKind::Pipe, start)
            }
            b'&' => {
                self.pos += 1;
                self.make(TokenKind::Ampersand, start)
            }
            b';' => {
                self.pos += 1;
                self.make(TokenKind::Semicolon, start)
            }
            b'<' => {
                self.pos += 1;
                self.make(TokenKind::RedirIn, start)
            }
            b'>' => {
                self.pos += 1;
                if self.peek() == Some(b'>') {
                    self.pos += 1;
                    self.make(TokenKind::RedirAppend, start)
                } else {
                    self.make(TokenKind::RedirOut, start)
                }
            }
            b'(' | b')' => {
                self.pos += 1;
                let text = &self.input[start..self.pos];
                self.make(TokenKind::Error(ParseError::UnexpectedToken(text.to_string())), start)
            }
            b'"' | b'\'' => match self.closing_quote(start) {
                Some(close) => {
                    self.pos = close + 1;
                    Token {
                        kind: TokenKind::Word,
                        text: &self.input[start + 1..close],
                        span: start..self.pos,
                    }
                }
                None => {
                    self.pos = self.input.len();
                    self.make(TokenKind::Error(ParseError::UnterminatedQuote(ch as char)), start)
                }
            },
            _ => {
                // 裸ワード。途中のクォートは対応する閉じクォートまでをそのまま含める
                // （`name='a b'` を 1 ワードとして読むため）。
                while let Some(b) = self.peek() {
                    if is_delimiter(b) {
                        break;
                    }
                    if b == b'"' || b == b'\'' {
                        match self.closing_quote(self.pos) {
                            Some(close) => self.pos = close + 1,
                            None => {
                                self.pos = self.input.len();
                                return self.make(
                                    TokenKind::Error(ParseError::UnterminatedQuote(b as char)),
                                    start,
                                );
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                }
                self.make(TokenKind::Word, start)
            }
        }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let token = self.scan_token();
        if matches!(token.kind, TokenKind::Eof | TokenKind::Error(_)) {
            self.finished = true;
        }
        Some(token)
    }
}

// ── Parser ──────────────────────────────────────────────────────────

struct Parser<'a> {
    source: &'a str,
    tokens: Tokenizer<'a>,
    current: Token<'a>,
    /// 直前に消費したトークンの終端バイト位置。パイプラインのソース範囲の計算に使う。
    last_end: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        let mut tokens = Tokenizer::new(source);
        let current = tokens.scan_token();
        Self {
            source,
            tokens,
            current,
            last_end: 0,
        }
    }

    /// 現在のトークンを消費して返し、次のトークンを読み込む。
    fn advance(&mut self) -> Token<'a> {
        let next = self.tokens.scan_token();
        let token = std::mem::replace(&mut self.current, next);
        self.last_end = token.span.end;
        token
    }

    /// 現在のトークンを「ここでは受け付けない」エラーに変換する。
    fn unexpected(&self) -> ParseError {
        match &self.current.kind {
            TokenKind::Error(e) => e.clone(),
            TokenKind::Eof => ParseError::EmptyCommand,
            _ => ParseError::UnexpectedToken(self.current.text.to_string()),
        }
    }

    /// `sequence := pipeline (';' | '&') sequence?`
    fn parse_sequence(&mut self) -> Result<Vec<Pipeline>, ParseError> {
        let mut pipelines = Vec::new();
        while self.current.kind != TokenKind::Eof {
            let start = self.current.span.start;
            let stages = self.parse_pipeline()?;
            let mut background = false;
            match self.current.kind {
                TokenKind::Ampersand => {
                    self.advance();
                    background = true;
                }
                TokenKind::Semicolon => {}
                TokenKind::Eof => {}
                _ => return Err(self.unexpected()),
            }
            // `;` は表示テキストに含めない
            let text = self.source[start..self.last_end].to_string();
            if self.current.kind == TokenKind::Semicolon {
                self.advance();
            }
            pipelines.push(Pipeline {
                stages,
                background,
                text,
            });
        }
        Ok(pipelines)
    }

    /// `pipeline := command ('|' pipeline)?`
    fn parse_pipeline(&mut self) -> Result<Vec<SimpleCommand>, ParseError> {
        let mut stages = vec![self.parse_command()?];
        while self.current.kind == TokenKind::Pipe {
            self.advance();
            stages.push(self.parse_command()?);
        }
        Ok(stages)
    }

    /// `command := (word | redirection)+`
    fn parse_command(&mut self) -> Result<SimpleCommand, ParseError> {
        let mut cmd = SimpleCommand::default();
        loop {
            match self.current.kind {
                TokenKind::Word => {
                    let word = self.advance();
                    cmd.args.push(word.text.to_string());
                }
                TokenKind::RedirIn | TokenKind::RedirOut | TokenKind::RedirAppend => {
                    let op = self.advance();
                    let target = self.expect_filename(&op)?;
                    match op.kind {
                        TokenKind::RedirIn => cmd.input = Some(target),
                        TokenKind::RedirOut => {
                            cmd.output = Some(target);
                            cmd.append = false;
                        }
                        _ => {
                            cmd.output = Some(target);
                            cmd.append = true;
                        }
                    }
                }
                TokenKind::Error(ref e) => return Err(e.clone()),
                _ => break,
            }
        }
        if cmd.args.is_empty() {
            return Err(self.unexpected());
        }
        Ok(cmd)
    }

    /// リダイレクト演算子の直後のワードをファイル名として消費する。
    fn expect_filename(&mut self, op: &Token<'a>) -> Result<String, ParseError> {
        match self.current.kind {
            TokenKind::Word => Ok(self.advance().text.to_string()),
            TokenKind::Error(ref e) => Err(e.clone()),
            _ => Err(ParseError::MissingRedirectTarget(match op.kind {
                TokenKind::RedirIn => "<",
                TokenKind::RedirOut => ">",
                _ => ">>",
            })),
        }
    }
}

/// 入力行をパースし、トップレベルのパイプライン列を返す。
///
/// 空行・空白のみの行は空の `Vec`。構文エラーは行全体のエラーとなり、
/// 途中まで構築したノードはすべて破棄される。
pub fn parse(input: &str) -> Result<Vec<Pipeline>, ParseError> {
    Parser::new(input).parse_sequence()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// パース結果から各パイプラインの各ステージの args を取り出すヘルパー。
    fn parse_args(input: &str) -> Vec<Vec<Vec<String>>> {
        parse(input)
            .unwrap()
            .into_iter()
            .map(|p| p.stages.into_iter().map(|c| c.args).collect())
            .collect()
    }

    fn kinds(input: &str) -> Vec<TokenKind> {
        Tokenizer::new(input).map(|t| t.kind).collect()
    }

    // ── Tokenizer ──

    #[test]
    fn tokenizes_operators() {
        assert_eq!(
            kinds("a|b&;<>>>"),
            vec![
                TokenKind::Word,
                TokenKind::Pipe,
                TokenKind::Word,
                TokenKind::Ampersand,
                TokenKind::Semicolon,
                TokenKind::RedirIn,
                TokenKind::RedirAppend,
                TokenKind::RedirOut,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn tokenizer_is_finite_and_restartable() {
        let line = "echo hi | wc";
        let first: Vec<_> = Tokenizer::new(line).collect();
        let second: Vec<_> = Tokenizer::new(line).collect();
        assert_eq!(first, second);
        assert_eq!(first.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn scan_token_keeps_returning_eof() {
        let mut tokens = Tokenizer::new("ls");
        assert_eq!(tokens.scan_token().kind, TokenKind::Word);
        assert_eq!(tokens.scan_token().kind, TokenKind::Eof);
        assert_eq!(tokens.scan_token().kind, TokenKind::Eof);
    }

    #[test]
    fn quoted_word_strips_quotes_and_keeps_span() {
        let line = r#"echo "a b""#;
        let tokens: Vec<_> = Tokenizer::new(line).collect();
        assert_eq!(tokens[1].text, "a b");
        assert_eq!(&line[tokens[1].span.clone()], "\"a b\"");
    }

    #[test]
    fn unterminated_quote_is_error_token() {
        let tokens: Vec<_> = Tokenizer::new("echo 'abc").collect();
        assert_eq!(tokens.len(), 2);
        assert_eq!(
            tokens[1].kind,
            TokenKind::Error(ParseError::UnterminatedQuote('\''))
        );
    }

    #[test]
    fn word_stops_at_operator() {
        let tokens: Vec<_> = Tokenizer::new("ls>out").collect();
        assert_eq!(tokens[0].text, "ls");
        assert_eq!(tokens[1].kind, TokenKind::RedirOut);
        assert_eq!(tokens[2].text, "out");
    }

    #[test]
    fn inner_quote_stays_in_word() {
        let tokens: Vec<_> = Tokenizer::new("alias ll='reveal -l'").collect();
        assert_eq!(tokens[1].text, "ll='reveal -l'");
        assert_eq!(tokens[2].kind, TokenKind::Eof);
    }

    // ── Parser ──

    #[test]
    fn simple_command() {
        assert_eq!(parse_args("echo hello world"), vec![vec![vec!["echo", "hello", "world"]]]);
    }

    #[test]
    fn empty_input() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   \t").unwrap().is_empty());
    }

    #[test]
    fn three_stage_pipeline() {
        let p = parse("cat f | grep x | wc -l").unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].stages.len(), 3);
        assert_eq!(p[0].stages[2].args, vec!["wc", "-l"]);
        assert!(!p[0].background);
    }

    #[test]
    fn redirections() {
        let p = parse("sort < in.txt > out.txt").unwrap();
        let cmd = &p[0].stages[0];
        assert_eq!(cmd.args, vec!["sort"]);
        assert_eq!(cmd.input.as_deref(), Some("in.txt"));
        assert_eq!(cmd.output.as_deref(), Some("out.txt"));
        assert!(!cmd.append);
    }

    #[test]
    fn append_redirection() {
        let p = parse("echo x >> log.txt").unwrap();
        let cmd = &p[0].stages[0];
        assert_eq!(cmd.output.as_deref(), Some("log.txt"));
        assert!(cmd.append);
    }

    #[test]
    fn later_redirection_wins() {
        let p = parse("echo x >> a > b").unwrap();
        let cmd = &p[0].stages[0];
        assert_eq!(cmd.output.as_deref(), Some("b"));
        assert!(!cmd.append);
    }

    #[test]
    fn redirect_target_is_not_an_argument() {
        let p = parse("cat < in extra").unwrap();
        assert_eq!(p[0].stages[0].args, vec!["cat", "extra"]);
    }

    #[test]
    fn background_applies_to_whole_pipeline() {
        let p = parse("a | b &").unwrap();
        assert_eq!(p.len(), 1);
        assert!(p[0].background);
        assert_eq!(p[0].text, "a | b &");
    }

    #[test]
    fn sequence_with_background_and_semicolon() {
        let p = parse("sleep 5 & echo hi ; ls").unwrap();
        assert_eq!(p.len(), 3);
        assert!(p[0].background);
        assert!(!p[1].background);
        assert_eq!(p[0].text, "sleep 5 &");
        assert_eq!(p[1].text, "echo hi");
        assert_eq!(p[2].text, "ls");
    }

    #[test]
    fn trailing_semicolon_is_valid() {
        let p = parse("echo a;").unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].text, "echo a");
    }

    #[test]
    fn text_is_exact_consumed_substring() {
        let line = "  echo  \"a  b\" > out ;cat<in|wc   &  ls -l;";
        let p = parse(line).unwrap();
        let texts: Vec<&str> = p.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["echo  \"a  b\" > out", "cat<in|wc   &", "ls -l"]);
        for t in texts {
            assert!(line.contains(t));
        }
    }

    #[test]
    fn quotes_keep_operators_literal() {
        assert_eq!(parse_args("echo 'a | b; c'"), vec![vec![vec!["echo", "a | b; c"]]]);
    }

    #[test]
    fn err_missing_redirect_target() {
        assert_eq!(parse("cat <"), Err(ParseError::MissingRedirectTarget("<")));
        assert_eq!(parse("echo >"), Err(ParseError::MissingRedirectTarget(">")));
        assert_eq!(parse("echo >> | wc"), Err(ParseError::MissingRedirectTarget(">>")));
    }

    #[test]
    fn err_unterminated_quote() {
        assert_eq!(parse("echo \"abc"), Err(ParseError::UnterminatedQuote('"')));
    }

    #[test]
    fn err_leading_pipe() {
        assert_eq!(parse("| wc"), Err(ParseError::UnexpectedToken("|".into())));
    }

    #[test]
    fn err_trailing_pipe() {
        assert_eq!(parse("ls |"), Err(ParseError::EmptyCommand));
    }

    #[test]
    fn err_double_separator() {
        assert_eq!(parse("a ;; b"), Err(ParseError::UnexpectedToken(";".into())));
    }

    #[test]
    fn err_parenthesis_is_trailing_garbage() {
        assert_eq!(parse("echo (x)"), Err(ParseError::UnexpectedToken("(".into())));
    }

    #[test]
    fn err_aborts_whole_line() {
        // 先頭のパイプラインが正しくても行全体がエラーになる
        assert!(parse("echo ok ; cat <").is_err());
    }

    #[test]
    fn redirect_only_command_is_error() {
        assert_eq!(parse("> out"), Err(ParseError::EmptyCommand));
    }
}
