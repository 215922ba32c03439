//! Lexer for the command markup: raw text to a flat token stream.
//!
//! The lexer is modal: outside a marker it accumulates opaque content
//! (with `\<`/`\>` unescaped), inside a marker (between `<tag` and `>`)
//! it produces attribute name/value pairs. It never interprets nesting;
//! that is the parser's job.

use std::ops::Range;

use thiserror::Error;

/// Tags recognized by the lexer.
///
/// Result-side tags (`result`, `output`, `error`) are included so that a
/// rendered result document re-lexes cleanly under the same rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Bash,
    Python,
    Task,
    Service,
    Package,
    Description,
    Commands,
    Dependencies,
    Result,
    Output,
    Error,
}

impl Tag {
    pub fn as_str(self) -> &'static str {
        match self {
            Tag::Bash => "bash",
            Tag::Python => "python",
            Tag::Task => "task",
            Tag::Service => "service",
            Tag::Package => "package",
            Tag::Description => "description",
            Tag::Commands => "commands",
            Tag::Dependencies => "dependencies",
            Tag::Result => "result",
            Tag::Output => "output",
            Tag::Error => "error",
        }
    }

    fn from_name(name: &str) -> Option<Tag> {
        match name {
            "bash" => Some(Tag::Bash),
            "python" => Some(Tag::Python),
            "task" => Some(Tag::Task),
            "service" => Some(Tag::Service),
            "package" => Some(Tag::Package),
            "description" => Some(Tag::Description),
            "commands" => Some(Tag::Commands),
            "dependencies" => Some(Tag::Dependencies),
            "result" => Some(Tag::Result),
            "output" => Some(Tag::Output),
            "error" => Some(Tag::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// `<tag`, opening a marker. Attributes may follow until [`TokenKind::MarkerEnd`].
    Open(Tag),
    /// `</tag>`.
    Close(Tag),
    /// The `>` terminating an open marker.
    MarkerEnd,
    /// Attribute name inside a marker.
    AttrName(String),
    /// Double-quoted attribute value, quotes stripped, no escape processing.
    AttrValue(String),
    /// Opaque text run with `\<`/`\>` already unescaped.
    Content(String),
    /// `#id` reference.
    IdRef(String),
    /// `@name` reference.
    NameRef(String),
    /// `,` separating dependency references.
    Comma,
}

impl TokenKind {
    /// Literal text a content-position token contributes when the parser
    /// folds it back into opaque content.
    pub fn content_text(&self) -> Option<String> {
        match self {
            TokenKind::Content(text) => Some(text.clone()),
            TokenKind::IdRef(id) => Some(format!("#{id}")),
            TokenKind::NameRef(name) => Some(format!("@{name}")),
            TokenKind::Comma => Some(",".to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte range in the source document.
    pub span: Range<usize>,
}

/// Lexing failure, carrying the byte offset of the first unrecognized
/// construct.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at byte {offset}")]
pub struct LexError {
    pub message: String,
    pub offset: usize,
}

impl LexError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        LexError {
            message: message.into(),
            offset,
        }
    }
}

/// Tokenize a command document.
///
/// Deterministic and order-preserving: the same input always yields the
/// same token sequence. Fails on the first unrecognized construct.
pub fn lex(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    tokens: Vec<Token>,
    content_start: usize,
    content: String,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src,
            pos: 0,
            tokens: Vec::new(),
            content_start: 0,
            content: String::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while let Some(ch) = self.peek() {
            match ch {
                '\\' => self.lex_escape(),
                '<' => {
                    self.flush_content();
                    self.lex_marker()?;
                }
                '>' => {
                    return Err(LexError::new("unescaped '>' outside a marker", self.pos));
                }
                '#' | '@' if self.ref_follows() => {
                    self.flush_content();
                    self.lex_reference(ch);
                }
                ',' => {
                    self.flush_content();
                    self.push(TokenKind::Comma, self.pos..self.pos + 1);
                    self.bump();
                }
                _ => {
                    self.push_content_char(ch);
                }
            }
        }
        self.flush_content();
        Ok(self.tokens)
    }

    /// `\<` and `\>` are literal angle brackets; any other backslash is
    /// ordinary content.
    fn lex_escape(&mut self) {
        if self.content.is_empty() {
            self.content_start = self.pos;
        }
        self.bump();
        match self.peek() {
            Some(next @ ('<' | '>')) => {
                self.content.push(next);
                self.bump();
            }
            _ => self.content.push('\\'),
        }
    }

    fn lex_marker(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        self.bump();

        if self.peek() == Some('/') {
            self.bump();
            let name = self.take_ident();
            let tag = Tag::from_name(&name)
                .ok_or_else(|| LexError::new(format!("unrecognized close tag '{name}'"), start))?;
            if self.peek() != Some('>') {
                return Err(LexError::new("expected '>' after close tag name", self.pos));
            }
            self.bump();
            self.push(TokenKind::Close(tag), start..self.pos);
            return Ok(());
        }

        let name = self.take_ident();
        let tag = Tag::from_name(&name)
            .ok_or_else(|| LexError::new(format!("unrecognized tag '{name}'"), start))?;
        self.push(TokenKind::Open(tag), start..self.pos);
        self.lex_marker_interior()
    }

    /// Attribute pairs and the terminating `>` of an open marker.
    fn lex_marker_interior(&mut self) -> Result<(), LexError> {
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('>') => {
                    self.push(TokenKind::MarkerEnd, self.pos..self.pos + 1);
                    self.bump();
                    return Ok(());
                }
                Some(ch) if is_ident_start(ch) => {
                    let name_start = self.pos;
                    let name = self.take_ident();
                    self.push(TokenKind::AttrName(name), name_start..self.pos);

                    self.skip_whitespace();
                    if self.peek() != Some('=') {
                        return Err(LexError::new("expected '=' after attribute name", self.pos));
                    }
                    self.bump();
                    self.skip_whitespace();

                    let quote_offset = self.pos;
                    if self.peek() != Some('"') {
                        return Err(LexError::new(
                            "expected '\"' to open attribute value",
                            quote_offset,
                        ));
                    }
                    self.bump();
                    let value_start = self.pos;
                    let Some(rel) = self.src[self.pos..].find('"') else {
                        return Err(LexError::new(
                            "unterminated attribute value",
                            quote_offset,
                        ));
                    };
                    let value = self.src[value_start..value_start + rel].to_string();
                    self.pos = value_start + rel + 1;
                    self.push(TokenKind::AttrValue(value), quote_offset..self.pos);
                }
                Some(_) => {
                    return Err(LexError::new(
                        "expected attribute name or '>' inside marker",
                        self.pos,
                    ));
                }
                None => {
                    return Err(LexError::new("unexpected end of input inside marker", self.pos));
                }
            }
        }
    }

    fn lex_reference(&mut self, sigil: char) {
        let start = self.pos;
        self.bump();
        let name = self.take_ident();
        let kind = if sigil == '#' {
            TokenKind::IdRef(name)
        } else {
            TokenKind::NameRef(name)
        };
        self.push(kind, start..self.pos);
    }

    /// True if the character after the current `#`/`@` starts an identifier.
    fn ref_follows(&self) -> bool {
        self.src[self.pos..]
            .chars()
            .nth(1)
            .is_some_and(is_ident_char)
    }

    fn push_content_char(&mut self, ch: char) {
        if self.content.is_empty() {
            self.content_start = self.pos;
        }
        self.content.push(ch);
        self.bump();
    }

    fn flush_content(&mut self) {
        if self.content.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.content);
        let span = self.content_start..self.pos;
        self.tokens.push(Token {
            kind: TokenKind::Content(text),
            span,
        });
    }

    fn take_ident(&mut self) -> String {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(ch) = self.peek() {
            self.pos += ch.len_utf8();
        }
    }

    fn push(&mut self, kind: TokenKind, span: Range<usize>) {
        self.tokens.push(Token { kind, span });
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source)
            .expect("lex")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_leaf_block() {
        assert_eq!(
            kinds("<bash>echo hi</bash>"),
            vec![
                TokenKind::Open(Tag::Bash),
                TokenKind::MarkerEnd,
                TokenKind::Content("echo hi".to_string()),
                TokenKind::Close(Tag::Bash),
            ]
        );
    }

    #[test]
    fn lexes_attributes() {
        assert_eq!(
            kinds("<task name=\"deploy\" priority=\"2\">"),
            vec![
                TokenKind::Open(Tag::Task),
                TokenKind::AttrName("name".to_string()),
                TokenKind::AttrValue("deploy".to_string()),
                TokenKind::AttrName("priority".to_string()),
                TokenKind::AttrValue("2".to_string()),
                TokenKind::MarkerEnd,
            ]
        );
    }

    /// Escaped angle brackets become literal characters in content, so
    /// embedded shell can redirect without closing the block.
    #[test]
    fn unescapes_angle_brackets_in_content() {
        let tokens = kinds("<bash>cat \\<in \\> out</bash>");
        assert_eq!(tokens[2], TokenKind::Content("cat <in > out".to_string()));
    }

    #[test]
    fn lexes_references_and_commas() {
        assert_eq!(
            kinds("#build, @deploy"),
            vec![
                TokenKind::IdRef("build".to_string()),
                TokenKind::Comma,
                TokenKind::Content(" ".to_string()),
                TokenKind::NameRef("deploy".to_string()),
            ]
        );
    }

    /// A `#` that does not start an identifier stays ordinary content.
    #[test]
    fn bare_sigil_is_content() {
        assert_eq!(
            kinds("# not a ref"),
            vec![TokenKind::Content("# not a ref".to_string())]
        );
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let err = lex("<nope>x</nope>").expect_err("should fail");
        assert_eq!(err.offset, 0);
        assert!(err.to_string().contains("unrecognized tag"));
    }

    /// The reported offset is the opening quote of the unterminated value.
    #[test]
    fn unterminated_attribute_value_points_at_opening_quote() {
        let source = "<task name=\"broken>";
        let err = lex(source).expect_err("should fail");
        assert_eq!(err.offset, source.find('"').unwrap());
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn unescaped_close_bracket_is_an_error() {
        let err = lex("<bash>echo a > b</bash>").expect_err("should fail");
        assert!(err.to_string().contains("unescaped '>'"));
    }

    #[test]
    fn lone_backslash_is_preserved() {
        let tokens = kinds("<bash>echo a\\b</bash>");
        assert_eq!(tokens[2], TokenKind::Content("echo a\\b".to_string()));
    }
}
