//! Token definitions for the canonical text form.

use logos::Logos;

/// Tokens of the canonical text form.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token {
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    /// Concurrency hint marker before a parenthesised node.
    #[token("||")]
    Concurrent,

    /// Line comment, attached to the following node.
    #[regex(r";[^\n]*")]
    Comment,

    /// Label prefix: `#name`.
    #[regex(r"#[A-Za-z_][A-Za-z0-9_.\-]*")]
    Label,

    /// Quoted string with backslash escapes.
    #[regex(r#""([^"\\]|\\.)*""#)]
    Str,

    /// Numeric literal.
    #[regex(r"-?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?", priority = 3)]
    Number,

    /// Identifier: opcode keyword after `(`, literal or symbol elsewhere.
    #[regex(r"[A-Za-z_+*/<>=!~.\-][A-Za-z0-9_+*/<>=!~.\-]*")]
    Ident,
}

/// A lexed token with its source slice and byte span.
#[derive(Debug, Clone, Copy)]
pub struct Lexeme<'src> {
    pub token: Token,
    pub text: &'src str,
    pub start: usize,
}

/// Lex the whole source, reporting the byte offset of the first bad token.
pub fn lex(source: &str) -> Result<Vec<Lexeme<'_>>, usize> {
    let mut lexer = Token::lexer(source);
    let mut out = Vec::new();
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => out.push(Lexeme {
                token,
                text: &source[span.start..span.end],
                start: span.start,
            }),
            Err(()) => return Err(span.start),
        }
    }
    Ok(out)
}

/// Decode the backslash escapes of a quoted string body.
pub fn unescape(quoted: &str) -> String {
    let body = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Encode a string into its quoted literal form.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexes_core_tokens() {
        let lexemes = lex(r#"(+ 1 -2.5 "s" sym #lab ; note"#).expect("lex");
        let kinds: Vec<Token> = lexemes.iter().map(|l| l.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::LParen,
                Token::Ident,
                Token::Number,
                Token::Number,
                Token::Str,
                Token::Ident,
                Token::Label,
                Token::Comment,
            ]
        );
    }

    #[test]
    fn minus_alone_is_an_identifier() {
        let lexemes = lex("- -3").expect("lex");
        assert_eq!(lexemes[0].token, Token::Ident);
        assert_eq!(lexemes[1].token, Token::Number);
    }

    #[test]
    fn escape_round_trip() {
        for s in ["", "plain", "with \"quotes\"", "line\nbreak\\tab\t"] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }

    #[test]
    fn bad_character_reports_offset() {
        let err = lex("(list @)").unwrap_err();
        assert_eq!(err, 6);
    }
}
