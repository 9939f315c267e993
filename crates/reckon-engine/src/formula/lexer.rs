//! Tokenizer for the expression language.
//!
//! Tokens carry their byte offset in the source so that parse errors can
//! report line/column and rename patching can splice exact identifier spans.
//! Newlines are ordinary whitespace; `#` comments run to end of line and are
//! collected separately.

use thiserror::Error;

/// A syntax error with 1-based line and column offsets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} on line {line} col {col}")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl SyntaxError {
    pub fn at(src: &str, pos: usize, message: impl Into<String>) -> SyntaxError {
        let mut line = 1;
        let mut col = 1;
        for (i, ch) in src.char_indices() {
            if i >= pos {
                break;
            }
            if ch == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        SyntaxError { message: message.into(), line, col }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Keywords.
    And,
    Or,
    Not,
    In,
    Is,
    True,
    False,
    None,
    // Punctuation and operators.
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Assign,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

/// Tokenize the source. Returns the token stream (ending with Eof) and the
/// comments encountered, each with its byte offset.
pub fn lex(src: &str) -> Result<(Vec<Token>, Vec<(usize, String)>), SyntaxError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut comments = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            comments.push((start, src[start + 1..i].to_string()));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            let word = &src[start..i];
            let kind = match word {
                "and" => TokenKind::And,
                "or" => TokenKind::Or,
                "not" => TokenKind::Not,
                "in" => TokenKind::In,
                "is" => TokenKind::Is,
                "True" => TokenKind::True,
                "False" => TokenKind::False,
                "None" => TokenKind::None,
                _ => TokenKind::Name(word.to_string()),
            };
            tokens.push(Token { kind, pos: start });
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let mut is_float = false;
            while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' && i + 1 < bytes.len()
                && (bytes[i + 1] as char).is_ascii_digit()
            {
                is_float = true;
                i += 1;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
            }
            let text = &src[start..i];
            let kind = if is_float {
                match text.parse::<f64>() {
                    Ok(f) => TokenKind::Float(f),
                    Err(_) => return Err(SyntaxError::at(src, start, "invalid number")),
                }
            } else {
                match text.parse::<i64>() {
                    Ok(n) => TokenKind::Int(n),
                    Err(_) => return Err(SyntaxError::at(src, start, "invalid number")),
                }
            };
            tokens.push(Token { kind, pos: start });
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = bytes[i];
            let start = i;
            i += 1;
            let mut text = String::new();
            loop {
                if i >= bytes.len() {
                    return Err(SyntaxError::at(src, start, "unterminated string literal"));
                }
                let b = bytes[i];
                if b == b'\\' {
                    if i + 1 >= bytes.len() {
                        return Err(SyntaxError::at(src, start, "unterminated string literal"));
                    }
                    let esc = bytes[i + 1] as char;
                    text.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        '\\' => '\\',
                        '\'' => '\'',
                        '"' => '"',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if b == quote {
                    i += 1;
                    break;
                }
                // Step over one full UTF-8 character.
                let ch_len = src[i..].chars().next().map(|ch| ch.len_utf8()).unwrap_or(1);
                text.push_str(&src[i..i + ch_len]);
                i += ch_len;
            }
            tokens.push(Token { kind: TokenKind::Str(text), pos: start });
            continue;
        }

        let two = if i + 1 < bytes.len() && bytes[i].is_ascii() && bytes[i + 1].is_ascii() {
            &src[i..i + 2]
        } else {
            ""
        };
        let (kind, len) = match two {
            "==" => (TokenKind::EqEq, 2),
            "!=" => (TokenKind::NotEq, 2),
            "<=" => (TokenKind::LtE, 2),
            ">=" => (TokenKind::GtE, 2),
            _ => match c {
                '(' => (TokenKind::LParen, 1),
                ')' => (TokenKind::RParen, 1),
                '[' => (TokenKind::LBracket, 1),
                ']' => (TokenKind::RBracket, 1),
                ',' => (TokenKind::Comma, 1),
                '.' => (TokenKind::Dot, 1),
                '+' => (TokenKind::Plus, 1),
                '-' => (TokenKind::Minus, 1),
                '*' => (TokenKind::Star, 1),
                '/' => (TokenKind::Slash, 1),
                '%' => (TokenKind::Percent, 1),
                '<' => (TokenKind::Lt, 1),
                '>' => (TokenKind::Gt, 1),
                '=' => (TokenKind::Assign, 1),
                _ => {
                    return Err(SyntaxError::at(src, i, format!("unexpected character {:?}", c)));
                }
            },
        };
        tokens.push(Token { kind, pos: i });
        i += len;
    }

    tokens.push(Token { kind: TokenKind::Eof, pos: src.len() });
    Ok((tokens, comments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lex_positions() {
        let (tokens, _) = lex("rec.office == 'Seattle'").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Name("rec".into()));
        assert_eq!(tokens[0].pos, 0);
        assert_eq!(tokens[2].kind, TokenKind::Name("office".into()));
        assert_eq!(tokens[2].pos, 4);
        assert_eq!(tokens[3].kind, TokenKind::EqEq);
        assert_eq!(tokens[4].kind, TokenKind::Str("Seattle".into()));
    }

    #[test]
    fn test_lex_numbers() {
        let (tokens, _) = lex("1 2.5 10%3").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Int(1));
        assert_eq!(tokens[1].kind, TokenKind::Float(2.5));
        assert_eq!(tokens[2].kind, TokenKind::Int(10));
        assert_eq!(tokens[3].kind, TokenKind::Percent);
    }

    #[test]
    fn test_lex_comments_collected() {
        let (tokens, comments) = lex("x # first\ny # second").unwrap();
        assert_eq!(comments, vec![(2, " first".to_string()), (12, " second".to_string())]);
        assert_eq!(tokens.len(), 3); // x, y, Eof
    }

    #[test]
    fn test_lex_error_position() {
        let err = lex("a ?\nb").unwrap_err();
        assert_eq!((err.line, err.col), (1, 3));
        let err = lex("ab\ncd ?").unwrap_err();
        assert_eq!((err.line, err.col), (2, 4));
    }

    #[test]
    fn test_string_escapes() {
        let (tokens, _) = lex(r#""he said \"hi\"\n""#).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str("he said \"hi\"\n".into()));
    }
}
