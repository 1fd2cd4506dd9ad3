//! Script splitting and statement classification.
//!
//! A script is scanned once into tokens, skipping string literals, quoted
//! identifiers and comments, so a `;` inside any of them never ends a
//! statement. `CREATE TRIGGER` bodies are kept whole by tracking their
//! `BEGIN ... END` nesting.
//!
//! # Example
//!
//! ```
//! use workbench_script::statement::{StatementKind, split_statements};
//!
//! let statements = split_statements("CREATE TABLE t (x); INSERT INTO t VALUES (';'); SELECT * FROM t");
//! let kinds: Vec<_> = statements.iter().map(|s| s.kind).collect();
//! assert_eq!(kinds, [StatementKind::Ddl, StatementKind::Dml, StatementKind::Select]);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse statement category used by the transaction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatementKind {
   /// Returns rows without modifying state (SELECT, VALUES, EXPLAIN, ...)
   Select,
   /// Schema changes (CREATE, ALTER, DROP, ...)
   Ddl,
   /// Data changes (INSERT, UPDATE, DELETE, ...)
   Dml,
   /// Anything else, including transaction control and PRAGMA
   Other,
}

impl fmt::Display for StatementKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         StatementKind::Select => "SELECT",
         StatementKind::Ddl => "DDL",
         StatementKind::Dml => "DML",
         StatementKind::Other => "OTHER",
      };
      f.write_str(name)
   }
}

/// Which statement kinds make a multi-statement script run inside one
/// transaction.
pub const TRANSACTION_POLICY: &[(StatementKind, bool)] = &[
   (StatementKind::Select, false),
   (StatementKind::Ddl, true),
   (StatementKind::Dml, true),
   (StatementKind::Other, false),
];

impl StatementKind {
   /// Look up the kind in [`TRANSACTION_POLICY`].
   pub fn needs_transaction(self) -> bool {
      TRANSACTION_POLICY
         .iter()
         .any(|&(kind, wraps)| kind == self && wraps)
   }
}

/// Transaction control written by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionControl {
   /// BEGIN, START TRANSACTION
   Begin,
   /// COMMIT, END, ROLLBACK, ABORT
   End,
   /// SAVEPOINT, RELEASE, ROLLBACK TO
   Savepoint,
}

/// One statement of a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
   /// Zero-based position in the script
   pub index: usize,
   /// Statement text without the trailing `;`, trimmed
   pub sql: String,
   /// Byte offset of `sql` in the script
   pub start: usize,
   /// Byte offset one past the end of `sql` in the script
   pub end: usize,
   pub kind: StatementKind,
   pub needs_transaction: bool,
   pub transaction_control: Option<TransactionControl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
   Word,
   QuotedIdent,
   Literal,
   Punct,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
   kind: TokenKind,
   /// Word text, or identifier text without its quotes
   text: &'a str,
   start: usize,
   depth: usize,
}

impl Token<'_> {
   fn is_word(&self, keyword: &str) -> bool {
      self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
   }

   fn is_punct(&self, punct: &str) -> bool {
      self.kind == TokenKind::Punct && self.text == punct
   }

   fn is_identifier(&self) -> bool {
      matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
   }
}

fn is_ident_byte(b: u8) -> bool {
   b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Advance past a quoted literal or identifier starting at `i`.
///
/// Doubled closing quotes are escapes. Returns the index of the closing
/// quote, or `len` when unterminated.
fn skip_quoted(bytes: &[u8], i: usize, close: u8) -> usize {
   let len = bytes.len();
   let mut j = i + 1;
   while j < len {
      if bytes[j] == close {
         if close != b']' && j + 1 < len && bytes[j + 1] == close {
            j += 2;
            continue;
         }
         return j;
      }
      j += 1;
   }
   len
}

/// Advance past a `--` comment. Returns the index of the newline or `len`.
fn skip_line_comment(bytes: &[u8], i: usize) -> usize {
   let mut j = i + 2;
   while j < bytes.len() && bytes[j] != b'\n' {
      j += 1;
   }
   j
}

/// Advance past a `/* */` comment. Returns the index after the closing `/`.
fn skip_block_comment(bytes: &[u8], i: usize) -> usize {
   let mut j = i + 2;
   while j + 1 < bytes.len() {
      if bytes[j] == b'*' && bytes[j + 1] == b'/' {
         return j + 2;
      }
      j += 1;
   }
   bytes.len()
}

/// Advance past a `$$ ... $$` string. Returns the index after the closing
/// `$$` or `len`.
fn skip_dollar_quoted(bytes: &[u8], i: usize) -> usize {
   let mut j = i + 2;
   while j + 1 < bytes.len() {
      if bytes[j] == b'$' && bytes[j + 1] == b'$' {
         return j + 2;
      }
      j += 1;
   }
   bytes.len()
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
   let bytes = sql.as_bytes();
   let len = bytes.len();
   let mut tokens = Vec::new();
   let mut depth = 0usize;
   let mut i = 0;

   while i < len {
      let b = bytes[i];
      match b {
         _ if b.is_ascii_whitespace() => i += 1,
         b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
         b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
         b'$' if bytes.get(i + 1) == Some(&b'$') => {
            let end = skip_dollar_quoted(bytes, i);
            tokens.push(Token {
               kind: TokenKind::Literal,
               text: &sql[i..end],
               start: i,
               depth,
            });
            i = end;
         }
         b'\'' => {
            let end = (skip_quoted(bytes, i, b'\'') + 1).min(len);
            tokens.push(Token {
               kind: TokenKind::Literal,
               text: &sql[i..end],
               start: i,
               depth,
            });
            i = end;
         }
         b'"' | b'`' | b'[' => {
            let close = if b == b'[' { b']' } else { b };
            let close_at = skip_quoted(bytes, i, close);
            tokens.push(Token {
               kind: TokenKind::QuotedIdent,
               text: &sql[i + 1..close_at],
               start: i,
               depth,
            });
            i = (close_at + 1).min(len);
         }
         _ if is_ident_byte(b) => {
            let mut j = i + 1;
            while j < len && is_ident_byte(bytes[j]) {
               j += 1;
            }
            tokens.push(Token {
               kind: TokenKind::Word,
               text: &sql[i..j],
               start: i,
               depth,
            });
            i = j;
         }
         _ => {
            if b == b')' {
               depth = depth.saturating_sub(1);
            }
            tokens.push(Token {
               kind: TokenKind::Punct,
               text: &sql[i..i + 1],
               start: i,
               depth,
            });
            if b == b'(' {
               depth += 1;
            }
            i += 1;
         }
      }
   }

   tokens
}

/// True when the statement's leading words are `CREATE [TEMP] TRIGGER`.
fn is_create_trigger(tokens: &[Token<'_>]) -> bool {
   tokens.first().is_some_and(|t| t.is_word("CREATE"))
      && tokens.iter().take(4).any(|t| t.is_word("TRIGGER"))
}

/// Split a script into classified statements.
///
/// Empty and comment-only statements are dropped; indexes count only the
/// statements that remain.
pub fn split_statements(script: &str) -> Vec<Statement> {
   let tokens = tokenize(script);
   let mut statements = Vec::new();
   let mut segment_start = 0usize;
   let mut first_token = 0usize;
   let mut block_depth = 0usize;

   let push = |from: usize, to: usize, tokens: &[Token<'_>], statements: &mut Vec<Statement>| {
      if tokens.is_empty() {
         return;
      }
      let raw = &script[from..to];
      let sql = raw.trim();
      let start = from + (raw.len() - raw.trim_start().len());
      let (kind, transaction_control) = classify_tokens(tokens);
      statements.push(Statement {
         index: statements.len(),
         sql: sql.to_string(),
         start,
         end: start + sql.len(),
         kind,
         needs_transaction: kind.needs_transaction(),
         transaction_control,
      });
   };

   for (i, token) in tokens.iter().enumerate() {
      if is_create_trigger(&tokens[first_token..i]) {
         if token.is_word("BEGIN") || token.is_word("CASE") {
            block_depth += 1;
         } else if token.is_word("END") {
            block_depth = block_depth.saturating_sub(1);
         }
      }

      if token.is_punct(";") && block_depth == 0 {
         push(segment_start, token.start, &tokens[first_token..i], &mut statements);
         segment_start = token.start + 1;
         first_token = i + 1;
      }
   }
   push(segment_start, script.len(), &tokens[first_token..], &mut statements);

   statements
}

/// Classify one statement by its leading keyword.
pub fn classify_statement(sql: &str) -> (StatementKind, Option<TransactionControl>) {
   classify_tokens(&tokenize(sql))
}

fn classify_tokens(tokens: &[Token<'_>]) -> (StatementKind, Option<TransactionControl>) {
   let Some(first) = tokens.iter().position(|t| t.kind == TokenKind::Word) else {
      return (StatementKind::Other, None);
   };
   let keyword = tokens[first].text.to_ascii_uppercase();

   match keyword.as_str() {
      "SELECT" | "VALUES" | "TABLE" | "FROM" | "EXPLAIN" | "SHOW" | "DESCRIBE" | "DESC"
      | "SUMMARIZE" => (StatementKind::Select, None),
      "WITH" => (classify_with_query(&tokens[first..]), None),
      "CREATE" | "ALTER" | "DROP" | "COMMENT" => (StatementKind::Ddl, None),
      "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "REPLACE" | "UPSERT" | "TRUNCATE" | "COPY" => {
         (StatementKind::Dml, None)
      }
      "BEGIN" | "START" => (StatementKind::Other, Some(TransactionControl::Begin)),
      "COMMIT" | "END" | "ABORT" => (StatementKind::Other, Some(TransactionControl::End)),
      "ROLLBACK" => {
         let to_savepoint = tokens[first + 1..]
            .iter()
            .find(|t| t.kind == TokenKind::Word && !t.is_word("TRANSACTION"))
            .is_some_and(|t| t.is_word("TO"));
         let control = if to_savepoint {
            TransactionControl::Savepoint
         } else {
            TransactionControl::End
         };
         (StatementKind::Other, Some(control))
      }
      "SAVEPOINT" | "RELEASE" => (StatementKind::Other, Some(TransactionControl::Savepoint)),
      _ => (StatementKind::Other, None),
   }
}

const DML_VERBS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE", "REPLACE"];

/// A `WITH` query takes the kind of the first verb after the CTE list.
fn classify_with_query(tokens: &[Token<'_>]) -> StatementKind {
   let base = tokens.first().map_or(0, |t| t.depth);
   tokens
      .iter()
      .skip(1)
      .filter(|t| t.depth == base && t.kind == TokenKind::Word)
      .find_map(|t| {
         if t.is_word("SELECT") || t.is_word("VALUES") {
            Some(StatementKind::Select)
         } else if DML_VERBS.iter().any(|v| t.is_word(v)) {
            Some(StatementKind::Dml)
         } else {
            None
         }
      })
      .unwrap_or(StatementKind::Select)
}

/// True when a multi-statement script should run inside one transaction.
///
/// Scripts that manage their own transactions are never wrapped.
pub fn should_wrap(statements: &[Statement]) -> bool {
   statements.len() > 1
      && statements.iter().any(|s| s.needs_transaction)
      && statements.iter().all(|s| s.transaction_control.is_none())
}

/// True when the user's statements leave a transaction open.
pub fn leaves_transaction_open(statements: &[Statement]) -> bool {
   let mut open = false;
   for statement in statements {
      match statement.transaction_control {
         Some(TransactionControl::Begin) => open = true,
         Some(TransactionControl::End) => open = false,
         _ => {}
      }
   }
   open
}

const OBJECT_TYPES: &[&str] = &[
   "TABLE", "VIEW", "INDEX", "TRIGGER", "SCHEMA", "DATABASE", "SEQUENCE", "MACRO", "FUNCTION",
   "TYPE",
];

const NAME_MODIFIERS: &[&str] = &[
   "IF", "NOT", "EXISTS", "ONLY", "OR", "REPLACE", "ROLLBACK", "ABORT", "FAIL", "IGNORE",
];

/// Read a possibly qualified name (`a.b.c`) starting at `i`.
fn qualified_name<'a>(tokens: &[Token<'a>], mut i: usize) -> Vec<&'a str> {
   let mut segments = Vec::new();
   while let Some(token) = tokens.get(i) {
      if !token.is_identifier() {
         break;
      }
      segments.push(token.text);
      if tokens.get(i + 1).is_some_and(|t| t.is_punct(".")) {
         i += 2;
      } else {
         break;
      }
   }
   segments
}

/// Index of the first identifier after `i` that is not a modifier keyword.
fn name_after(tokens: &[Token<'_>], mut i: usize) -> usize {
   while tokens
      .get(i)
      .is_some_and(|t| t.kind == TokenKind::Word && NAME_MODIFIERS.iter().any(|m| t.is_word(m)))
   {
      i += 1;
   }
   i
}

/// Name segments of the objects a mutating statement writes to.
fn target_objects<'a>(tokens: &[Token<'a>], kind: StatementKind) -> Vec<&'a str> {
   let Some(first) = tokens.iter().position(|t| t.kind == TokenKind::Word) else {
      return Vec::new();
   };
   let base = tokens[first].depth;
   let top_level = |keyword: &str, from: usize| {
      tokens[from..]
         .iter()
         .position(|t| t.depth == base && t.is_word(keyword))
         .map(|p| p + from)
   };

   let mut targets = Vec::new();
   match kind {
      StatementKind::Ddl => {
         let object = tokens[first..]
            .iter()
            .position(|t| OBJECT_TYPES.iter().any(|o| t.is_word(o)))
            .map(|p| p + first);
         match object {
            Some(at) => {
               targets.extend(qualified_name(tokens, name_after(tokens, at + 1)));
               if tokens[at].is_word("INDEX") || tokens[at].is_word("TRIGGER") {
                  if let Some(on) = top_level("ON", at + 1) {
                     targets.extend(qualified_name(tokens, on + 1));
                  }
               }
            }
            // Unknown shape: every identifier counts
            None => targets.extend(tokens.iter().filter(|t| t.is_identifier()).map(|t| t.text)),
         }
      }
      StatementKind::Dml => {
         let verb = tokens[first..]
            .iter()
            .position(|t| {
               t.depth == base
                  && (DML_VERBS.iter().any(|v| t.is_word(v))
                     || t.is_word("UPSERT")
                     || t.is_word("TRUNCATE")
                     || t.is_word("COPY"))
            })
            .map(|p| p + first);
         let Some(verb) = verb else {
            return targets;
         };
         let name_at = if tokens[verb].is_word("UPDATE")
            || tokens[verb].is_word("COPY")
            || tokens[verb].is_word("TRUNCATE")
         {
            let mut i = name_after(tokens, verb + 1);
            if tokens.get(i).is_some_and(|t| t.is_word("TABLE")) {
               i += 1;
            }
            Some(i)
         } else if tokens[verb].is_word("DELETE") {
            top_level("FROM", verb).map(|i| name_after(tokens, i + 1))
         } else {
            top_level("INTO", verb).map(|i| name_after(tokens, i + 1))
         };
         if let Some(at) = name_at {
            targets.extend(qualified_name(tokens, at));
         }
      }
      StatementKind::Select | StatementKind::Other => {}
   }
   targets
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
   match pattern.strip_suffix('*') {
      Some(prefix) => {
         name.len() >= prefix.len()
            && name.is_char_boundary(prefix.len())
            && name[..prefix.len()].eq_ignore_ascii_case(prefix)
      }
      None => name.eq_ignore_ascii_case(pattern),
   }
}

/// Return the protected object a mutating statement writes to, if any.
///
/// Only DDL and DML are checked; reading system catalogs is allowed.
pub fn find_protected(statement: &Statement, protected: &[String]) -> Option<String> {
   if !matches!(statement.kind, StatementKind::Ddl | StatementKind::Dml) {
      return None;
   }
   let tokens = tokenize(&statement.sql);
   target_objects(&tokens, statement.kind)
      .into_iter()
      .find(|name| protected.iter().any(|p| matches_pattern(name, p)))
      .map(str::to_string)
}
