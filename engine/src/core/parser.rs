//! Recursive-descent parser: token stream to [`CommandSequence`].
//!
//! Nesting depth is unbounded; close markers must match the block kind
//! that opened them. All structural violations are fatal for the round.

use thiserror::Error;

use crate::core::ast::{
    CommandBlock, CommandSequence, ContainerBlock, ContainerKind, Group, GroupCommands, Reference,
};
use crate::core::token::{Tag, Token, TokenKind};

/// Structural grammar violation, naming expected vs. found at a byte
/// position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found} at byte {offset}")]
    Unexpected {
        expected: String,
        found: String,
        offset: usize,
    },
    #[error("duplicate attribute '{name}' at byte {offset}")]
    DuplicateAttribute { name: String, offset: usize },
    #[error("{kind} block requires at least one description/commands group at byte {offset}")]
    EmptyContainer { kind: String, offset: usize },
    #[error("dependency list must name at least one reference at byte {offset}")]
    EmptyDependencies { offset: usize },
    #[error("invalid timeout attribute value '{value}' at byte {offset}")]
    InvalidTimeout { value: String, offset: usize },
}

/// Parse a token stream into an ordered sequence of top-level blocks.
pub fn parse(tokens: &[Token]) -> Result<CommandSequence, ParseError> {
    let mut parser = Parser { tokens, pos: 0 };
    let mut blocks = Vec::new();

    parser.skip_blank_content();
    if parser.at_end() {
        return Err(parser.unexpected("a command block"));
    }
    while !parser.at_end() {
        blocks.push(parser.parse_block()?);
        parser.skip_blank_content();
    }

    Ok(CommandSequence { blocks })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn parse_block(&mut self) -> Result<CommandBlock, ParseError> {
        match self.peek() {
            Some(TokenKind::Open(Tag::Bash)) => self.parse_leaf(Tag::Bash),
            Some(TokenKind::Open(Tag::Python)) => self.parse_leaf(Tag::Python),
            Some(TokenKind::Open(Tag::Task)) => self.parse_container(ContainerKind::Task),
            Some(TokenKind::Open(Tag::Service)) => self.parse_container(ContainerKind::Service),
            Some(TokenKind::Open(Tag::Package)) => self.parse_container(ContainerKind::Package),
            _ => Err(self.unexpected("a command block")),
        }
    }

    /// `<bash>…</bash>` / `<python>…</python>`: no attributes, opaque body.
    fn parse_leaf(&mut self, tag: Tag) -> Result<CommandBlock, ParseError> {
        self.expect_open(tag)?;
        self.expect_marker_end(&format!("'>' ({} blocks take no attributes)", tag.as_str()))?;
        let content = self.content_until_close(tag)?;
        Ok(match tag {
            Tag::Bash => CommandBlock::Bash { content },
            Tag::Python => CommandBlock::Python { content },
            _ => unreachable!("parse_leaf called for non-leaf tag"),
        })
    }

    fn parse_container(&mut self, kind: ContainerKind) -> Result<CommandBlock, ParseError> {
        let open_tag = container_tag(kind);
        let open_offset = self.offset();
        self.expect_open(open_tag)?;
        let attributes = self.parse_attributes()?;
        self.expect_marker_end("'>'")?;

        let mut groups = Vec::new();
        loop {
            self.skip_blank_content();
            match self.peek() {
                Some(TokenKind::Open(Tag::Description)) => {
                    groups.push(self.parse_group()?);
                }
                Some(TokenKind::Close(tag)) if *tag == open_tag => {
                    self.bump();
                    break;
                }
                _ => {
                    return Err(self.unexpected(&format!(
                        "<description> or </{}>",
                        open_tag.as_str()
                    )));
                }
            }
        }

        if groups.is_empty() {
            return Err(ParseError::EmptyContainer {
                kind: kind.as_str().to_string(),
                offset: open_offset,
            });
        }

        Ok(CommandBlock::Container(ContainerBlock {
            kind,
            attributes,
            groups,
        }))
    }

    /// Attribute pairs until the marker's `>`. Duplicate names are
    /// rejected rather than resolved last-wins.
    fn parse_attributes(&mut self) -> Result<Vec<(String, String)>, ParseError> {
        let mut attributes: Vec<(String, String)> = Vec::new();
        while let Some(TokenKind::AttrName(name)) = self.peek() {
            let name = name.clone();
            let name_offset = self.offset();
            self.bump();

            let Some(TokenKind::AttrValue(value)) = self.peek() else {
                return Err(self.unexpected("an attribute value"));
            };
            let value = value.clone();
            let value_offset = self.offset();
            self.bump();

            if attributes.iter().any(|(n, _)| *n == name) {
                return Err(ParseError::DuplicateAttribute {
                    name,
                    offset: name_offset,
                });
            }
            if name == "timeout" && value.parse::<u64>().is_err() {
                return Err(ParseError::InvalidTimeout {
                    value,
                    offset: value_offset,
                });
            }
            attributes.push((name, value));
        }
        Ok(attributes)
    }

    /// One (description, commands, dependencies?) repetition.
    fn parse_group(&mut self) -> Result<Group, ParseError> {
        self.expect_open(Tag::Description)?;
        self.expect_marker_end("'>'")?;
        let description = self.content_until_close(Tag::Description)?;

        self.skip_blank_content();
        let commands = match self.peek() {
            Some(TokenKind::Open(Tag::Commands)) => {
                self.bump();
                self.expect_marker_end("'>'")?;
                GroupCommands::Raw(self.content_until_close(Tag::Commands)?)
            }
            Some(TokenKind::Open(
                Tag::Bash | Tag::Python | Tag::Task | Tag::Service | Tag::Package,
            )) => GroupCommands::Block(Box::new(self.parse_block()?)),
            _ => return Err(self.unexpected("<commands> or a nested command block")),
        };

        self.skip_blank_content();
        let dependencies = if matches!(self.peek(), Some(TokenKind::Open(Tag::Dependencies))) {
            self.parse_dependencies()?
        } else {
            Vec::new()
        };

        Ok(Group {
            description,
            commands,
            dependencies,
        })
    }

    /// `<dependencies>#id, @name</dependencies>`: at least one
    /// reference; anything other than references, commas, and whitespace
    /// is a structural error.
    fn parse_dependencies(&mut self) -> Result<Vec<Reference>, ParseError> {
        let open_offset = self.offset();
        self.expect_open(Tag::Dependencies)?;
        self.expect_marker_end("'>'")?;

        let mut references = Vec::new();
        loop {
            self.skip_blank_content();
            match self.peek() {
                Some(TokenKind::IdRef(id)) => {
                    references.push(Reference::ById(id.clone()));
                    self.bump();
                }
                Some(TokenKind::NameRef(name)) => {
                    references.push(Reference::ByName(name.clone()));
                    self.bump();
                }
                Some(TokenKind::Close(Tag::Dependencies)) if references.is_empty() => {
                    return Err(ParseError::EmptyDependencies {
                        offset: open_offset,
                    });
                }
                _ => return Err(self.unexpected("a #id or @name reference")),
            }
            self.skip_blank_content();
            match self.peek() {
                Some(TokenKind::Comma) => {
                    self.bump();
                }
                Some(TokenKind::Close(Tag::Dependencies)) => {
                    self.bump();
                    break;
                }
                _ => return Err(self.unexpected("',' or </dependencies>")),
            }
        }

        if references.is_empty() {
            return Err(ParseError::EmptyDependencies {
                offset: open_offset,
            });
        }
        Ok(references)
    }

    /// Fold content-position tokens (text, references, commas) into one
    /// opaque string until the matching close marker. Content is kept
    /// verbatim; edge whitespace can be significant to the tool.
    fn content_until_close(&mut self, tag: Tag) -> Result<String, ParseError> {
        let mut content = String::new();
        loop {
            match self.peek() {
                Some(TokenKind::Close(found)) if *found == tag => {
                    self.bump();
                    return Ok(content);
                }
                Some(kind) => match kind.content_text() {
                    Some(text) => {
                        content.push_str(&text);
                        self.bump();
                    }
                    None => {
                        return Err(
                            self.unexpected(&format!("content or </{}>", tag.as_str()))
                        );
                    }
                },
                None => {
                    return Err(self.unexpected(&format!("</{}>", tag.as_str())));
                }
            }
        }
    }

    fn expect_open(&mut self, tag: Tag) -> Result<(), ParseError> {
        match self.peek() {
            Some(TokenKind::Open(found)) if *found == tag => {
                self.bump();
                Ok(())
            }
            _ => Err(self.unexpected(&format!("<{}>", tag.as_str()))),
        }
    }

    fn expect_marker_end(&mut self, expected: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(TokenKind::MarkerEnd) => {
                self.bump();
                Ok(())
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    /// Skip whitespace-only content tokens between structural elements.
    fn skip_blank_content(&mut self) {
        while let Some(TokenKind::Content(text)) = self.peek() {
            if !text.trim().is_empty() {
                break;
            }
            self.bump();
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let (found, offset) = match self.tokens.get(self.pos) {
            Some(token) => (describe(&token.kind), token.span.start),
            None => (
                "end of input".to_string(),
                self.tokens.last().map_or(0, |t| t.span.end),
            ),
        };
        ParseError::Unexpected {
            expected: expected.to_string(),
            found,
            offset,
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map_or_else(|| self.tokens.last().map_or(0, |t| t.span.end), |t| t.span.start)
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

fn container_tag(kind: ContainerKind) -> Tag {
    match kind {
        ContainerKind::Task => Tag::Task,
        ContainerKind::Service => Tag::Service,
        ContainerKind::Package => Tag::Package,
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Open(tag) => format!("<{}>", tag.as_str()),
        TokenKind::Close(tag) => format!("</{}>", tag.as_str()),
        TokenKind::MarkerEnd => "'>'".to_string(),
        TokenKind::AttrName(name) => format!("attribute '{name}'"),
        TokenKind::AttrValue(_) => "an attribute value".to_string(),
        TokenKind::Content(_) => "content".to_string(),
        TokenKind::IdRef(id) => format!("#{id}"),
        TokenKind::NameRef(name) => format!("@{name}"),
        TokenKind::Comma => "','".to_string(),
    }
}

/// Lex and parse in one step.
pub fn parse_source(source: &str) -> Result<CommandSequence, crate::round::RoundError> {
    let tokens = crate::core::token::lex(source)?;
    Ok(parse(&tokens)?)
}
