//! Parser: tokens to node trees.

use crate::lexer::{lex, unescape, Lexeme, Token};
use sable_ir::{NodeKind, NodeManager, NodeRef};
use thiserror::Error;

/// Parse failures, with one-based source locations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A character no token matches.
    #[error("unexpected character at line {line}, column {column}")]
    BadToken { line: usize, column: usize },
    /// Source ended inside an open form.
    #[error("unexpected end of input at line {line}, column {column}")]
    UnexpectedEnd { line: usize, column: usize },
    /// A token that cannot start or continue a node here.
    #[error("unexpected {found} at line {line}, column {column}")]
    UnexpectedToken {
        found: &'static str,
        line: usize,
        column: usize,
    },
    /// `(word ...)` whose word is not an opcode keyword.
    #[error("unknown opcode keyword {keyword:?} at line {line}, column {column}")]
    UnknownKeyword {
        keyword: String,
        line: usize,
        column: usize,
    },
    /// Trailing tokens after the root node.
    #[error("trailing input at line {line}, column {column}")]
    TrailingInput { line: usize, column: usize },
}

/// Parser configuration.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Annotate each parsed node that has no explicit comment with its
    /// source location.
    pub debug_sources: bool,
}

/// Parse `source` into a tree owned by `manager`, default options.
pub fn parse(source: &str, manager: &mut NodeManager) -> Result<NodeRef, ParseError> {
    parse_with_options(source, manager, &ParseOptions::default())
}

/// Parse with explicit options.
pub fn parse_with_options(
    source: &str,
    manager: &mut NodeManager,
    options: &ParseOptions,
) -> Result<NodeRef, ParseError> {
    let lexemes = lex(source).map_err(|offset| {
        let (line, column) = line_column(source, offset);
        ParseError::BadToken { line, column }
    })?;

    let mut parser = Parser {
        source,
        lexemes: &lexemes,
        position: 0,
        options,
    };
    let root = parser.parse_node(manager)?;
    if parser.position < parser.lexemes.len() {
        let (line, column) = parser.location(parser.position);
        return Err(ParseError::TrailingInput { line, column });
    }
    Ok(root)
}

fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;
    for (index, c) in source.char_indices() {
        if index >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

struct Parser<'a, 'src> {
    source: &'src str,
    lexemes: &'a [Lexeme<'src>],
    position: usize,
    options: &'a ParseOptions,
}

/// Metadata accumulated in front of a node.
#[derive(Default)]
struct Prefix {
    labels: Vec<String>,
    comment: Option<String>,
    concurrent: bool,
}

impl<'src> Parser<'_, 'src> {
    fn location(&self, position: usize) -> (usize, usize) {
        let offset = self
            .lexemes
            .get(position)
            .map_or(self.source.len(), |l| l.start);
        line_column(self.source, offset)
    }

    fn end_error(&self) -> ParseError {
        let (line, column) = line_column(self.source, self.source.len());
        ParseError::UnexpectedEnd { line, column }
    }

    fn peek(&self) -> Option<&Lexeme<'src>> {
        self.lexemes.get(self.position)
    }

    fn bump(&mut self) -> Option<&Lexeme<'src>> {
        let lexeme = self.lexemes.get(self.position);
        if lexeme.is_some() {
            self.position += 1;
        }
        lexeme
    }

    /// Consume labels, comments, and concurrency markers preceding a node.
    fn collect_prefix(&mut self) -> Prefix {
        let mut prefix = Prefix::default();
        while let Some(lexeme) = self.peek() {
            match lexeme.token {
                Token::Label => {
                    prefix.labels.push(lexeme.text[1..].to_owned());
                    self.position += 1;
                }
                Token::Comment => {
                    let body = &lexeme.text[1..];
                    match &mut prefix.comment {
                        Some(comment) => {
                            comment.push('\n');
                            comment.push_str(body);
                        }
                        None => prefix.comment = Some(body.to_owned()),
                    }
                    self.position += 1;
                }
                Token::Concurrent => {
                    prefix.concurrent = true;
                    self.position += 1;
                }
                _ => break,
            }
        }
        prefix
    }

    fn parse_node(&mut self, manager: &mut NodeManager) -> Result<NodeRef, ParseError> {
        let prefix = self.collect_prefix();
        let start_position = self.position;
        let Some(lexeme) = self.bump().copied() else {
            return Err(self.end_error());
        };

        let node = match lexeme.token {
            Token::Number => {
                let value: f64 = lexeme.text.parse().unwrap_or(f64::NAN);
                manager.alloc_number(value)
            }
            Token::Str => {
                let text = unescape(lexeme.text);
                manager.alloc_string(&text)
            }
            Token::Ident => match lexeme.text {
                "true" => manager.alloc_bool(true),
                "false" => manager.alloc_bool(false),
                "null" => manager.alloc_null(),
                "infinity" => manager.alloc_number(f64::INFINITY),
                "-infinity" => manager.alloc_number(f64::NEG_INFINITY),
                "nan" => manager.alloc_number(f64::NAN),
                symbol => manager.alloc_symbol(symbol),
            },
            Token::LParen => self.parse_form(manager)?,
            Token::RParen => {
                let (line, column) = self.location(start_position);
                return Err(ParseError::UnexpectedToken {
                    found: "closing parenthesis",
                    line,
                    column,
                });
            }
            Token::Label | Token::Comment | Token::Concurrent => {
                unreachable!("prefix tokens consumed by collect_prefix")
            }
        };

        for label in &prefix.labels {
            manager.add_label(node.id, label);
        }
        if let Some(comment) = &prefix.comment {
            manager.set_comment(node.id, comment);
        } else if self.options.debug_sources {
            let (line, column) = self.location(start_position);
            manager.set_comment(node.id, &format!("line {line}, column {column}"));
        }
        if prefix.concurrent {
            manager.set_concurrent(node.id, true);
        }
        Ok(node)
    }

    fn parse_form(&mut self, manager: &mut NodeManager) -> Result<NodeRef, ParseError> {
        let keyword_position = self.position;
        let Some(head) = self.bump().copied() else {
            return Err(self.end_error());
        };
        if head.token != Token::Ident {
            let (line, column) = self.location(keyword_position);
            return Err(ParseError::UnexpectedToken {
                found: "non-keyword form head",
                line,
                column,
            });
        }

        let Some(kind) = NodeKind::from_keyword(head.text) else {
            let (line, column) = self.location(keyword_position);
            return Err(ParseError::UnknownKeyword {
                keyword: head.text.to_owned(),
                line,
                column,
            });
        };

        if kind.uses_assoc() {
            return self.parse_assoc_body(manager);
        }
        if kind.is_immediate() {
            // Immediates in parens take no children: `(null)` is just null.
            self.expect_rparen()?;
            return Ok(manager.alloc(kind));
        }

        let node = manager.alloc(kind);
        loop {
            match self.peek() {
                None => return Err(self.end_error()),
                Some(lexeme) if lexeme.token == Token::RParen => {
                    self.position += 1;
                    break;
                }
                Some(_) => {
                    let child = self.parse_node(manager)?;
                    manager.add_child(node.id, child);
                }
            }
        }
        Ok(node)
    }

    fn parse_assoc_body(&mut self, manager: &mut NodeManager) -> Result<NodeRef, ParseError> {
        let node = manager.alloc(NodeKind::Assoc);
        loop {
            let key_position = self.position;
            let Some(lexeme) = self.bump().copied() else {
                return Err(self.end_error());
            };
            let key = match lexeme.token {
                Token::RParen => break,
                Token::Ident => lexeme.text.to_owned(),
                Token::Str => unescape(lexeme.text),
                Token::Number => lexeme.text.to_owned(),
                _ => {
                    let (line, column) = self.location(key_position);
                    return Err(ParseError::UnexpectedToken {
                        found: "non-key token in assoc",
                        line,
                        column,
                    });
                }
            };
            let child = self.parse_node(manager)?;
            let key_id = manager.pool().intern(&key);
            manager.set_assoc_child(node.id, key_id, child);
        }
        Ok(node)
    }

    fn expect_rparen(&mut self) -> Result<(), ParseError> {
        let position = self.position;
        match self.bump() {
            Some(lexeme) if lexeme.token == Token::RParen => Ok(()),
            Some(_) => {
                let (line, column) = self.location(position);
                Err(ParseError::UnexpectedToken {
                    found: "token where a closing parenthesis was expected",
                    line,
                    column,
                })
            }
            None => Err(self.end_error()),
        }
    }
}
