//! Tokenizer for the script language.
//!
//! Works line by line. Leading whitespace of a logical line is turned into
//! `Indent`/`Dedent` tokens; newlines inside brackets are ignored so that
//! calls and literals can span several lines.

use std::fmt;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Newline,
    Indent,
    Dedent,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Name(name) => return write!(f, "'{}'", name),
            Token::Int(v) => return write!(f, "{}", v),
            Token::Float(v) => return write!(f, "{}", v),
            Token::Str(_) => "string literal",
            Token::Newline => "end of line",
            Token::Indent => "indent",
            Token::Dedent => "dedent",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::Comma => "','",
            Token::Colon => "':'",
            Token::Dot => "'.'",
            Token::Plus => "'+'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::StarStar => "'**'",
            Token::Slash => "'/'",
            Token::SlashSlash => "'//'",
            Token::Percent => "'%'",
            Token::Assign => "'='",
            Token::PlusAssign => "'+='",
            Token::MinusAssign => "'-='",
            Token::StarAssign => "'*='",
            Token::SlashAssign => "'/='",
            Token::EqEq => "'=='",
            Token::NotEq => "'!='",
            Token::Lt => "'<'",
            Token::Le => "'<='",
            Token::Gt => "'>'",
            Token::Ge => "'>='",
            Token::Eof => "end of file",
        };
        f.write_str(text)
    }
}

/// A token with the 1-based source line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub line: usize,
}

/// Lexing or parsing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: usize) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

impl std::error::Error for SyntaxError {}

/// Tokenize a whole source text.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, SyntaxError> {
    let mut tokens: Vec<SpannedToken> = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut depth = 0usize;
    let mut last_line = 0;

    for (idx, raw) in source.lines().enumerate() {
        let line = idx + 1;
        last_line = line;
        let chars: Vec<char> = raw.chars().collect();
        let mut start = 0;

        if depth == 0 {
            let width = chars
                .iter()
                .take_while(|c| **c == ' ' || **c == '\t')
                .count();
            let rest = &chars[width..];
            if rest.is_empty() || rest[0] == '#' {
                continue;
            }

            let current = *indents.last().unwrap_or(&0);
            if width > current {
                indents.push(width);
                tokens.push(SpannedToken {
                    token: Token::Indent,
                    line,
                });
            } else if width < current {
                while width < *indents.last().unwrap_or(&0) {
                    indents.pop();
                    tokens.push(SpannedToken {
                        token: Token::Dedent,
                        line,
                    });
                }
                if width != *indents.last().unwrap_or(&0) {
                    return Err(SyntaxError::new(
                        "unindent does not match any outer indentation level",
                        line,
                    ));
                }
            }
            start = width;
        }

        let produced = scan_line(&chars[start..], line, &mut depth, &mut tokens)?;
        if depth == 0 && produced {
            tokens.push(SpannedToken {
                token: Token::Newline,
                line,
            });
        }
    }

    if depth > 0 {
        return Err(SyntaxError::new("unexpected end of file inside brackets", last_line));
    }

    let end = last_line.max(1);
    if !matches!(
        tokens.last().map(|t| &t.token),
        None | Some(Token::Newline)
    ) {
        tokens.push(SpannedToken {
            token: Token::Newline,
            line: end,
        });
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(SpannedToken {
            token: Token::Dedent,
            line: end,
        });
    }
    tokens.push(SpannedToken {
        token: Token::Eof,
        line: end,
    });

    Ok(tokens)
}

/// Scan one physical line. Returns whether any token was produced.
fn scan_line(
    chars: &[char],
    line: usize,
    depth: &mut usize,
    tokens: &mut Vec<SpannedToken>,
) -> Result<bool, SyntaxError> {
    let mut i = 0;
    let mut produced = false;

    while i < chars.len() {
        let c = chars[i];

        if c == ' ' || c == '\t' || c == '\r' {
            i += 1;
            continue;
        }
        if c == '#' {
            break;
        }

        let token = if c.is_ascii_digit() {
            let (token, next) = scan_number(chars, i, line)?;
            i = next;
            token
        } else if c.is_alphabetic() || c == '_' {
            let begin = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            Token::Name(chars[begin..i].iter().collect())
        } else if c == '"' || c == '\'' {
            let (text, next) = scan_string(chars, i, line)?;
            i = next;
            Token::Str(text)
        } else {
            let next = chars.get(i + 1).copied();
            let (token, width) = match (c, next) {
                ('*', Some('*')) => (Token::StarStar, 2),
                ('/', Some('/')) => (Token::SlashSlash, 2),
                ('=', Some('=')) => (Token::EqEq, 2),
                ('!', Some('=')) => (Token::NotEq, 2),
                ('<', Some('=')) => (Token::Le, 2),
                ('>', Some('=')) => (Token::Ge, 2),
                ('+', Some('=')) => (Token::PlusAssign, 2),
                ('-', Some('=')) => (Token::MinusAssign, 2),
                ('*', Some('=')) => (Token::StarAssign, 2),
                ('/', Some('=')) => (Token::SlashAssign, 2),
                ('(', _) => (Token::LParen, 1),
                (')', _) => (Token::RParen, 1),
                ('[', _) => (Token::LBracket, 1),
                (']', _) => (Token::RBracket, 1),
                ('{', _) => (Token::LBrace, 1),
                ('}', _) => (Token::RBrace, 1),
                (',', _) => (Token::Comma, 1),
                (':', _) => (Token::Colon, 1),
                ('.', _) => (Token::Dot, 1),
                ('+', _) => (Token::Plus, 1),
                ('-', _) => (Token::Minus, 1),
                ('*', _) => (Token::Star, 1),
                ('/', _) => (Token::Slash, 1),
                ('%', _) => (Token::Percent, 1),
                ('=', _) => (Token::Assign, 1),
                ('<', _) => (Token::Lt, 1),
                ('>', _) => (Token::Gt, 1),
                _ => {
                    return Err(SyntaxError::new(
                        format!("invalid character '{}'", c),
                        line,
                    ));
                }
            };
            i += width;

            match token {
                Token::LParen | Token::LBracket | Token::LBrace => *depth += 1,
                Token::RParen | Token::RBracket | Token::RBrace => {
                    if *depth == 0 {
                        return Err(SyntaxError::new(format!("unmatched {}", token), line));
                    }
                    *depth -= 1;
                }
                _ => {}
            }
            token
        };

        tokens.push(SpannedToken { token, line });
        produced = true;
    }

    Ok(produced)
}

fn scan_number(chars: &[char], start: usize, line: usize) -> Result<(Token, usize), SyntaxError> {
    let mut i = start;
    let mut is_float = false;

    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
        i += 1;
    }
    if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
        is_float = true;
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            is_float = true;
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }

    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    let token = if is_float {
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| SyntaxError::new(format!("invalid number '{}'", text), line))?
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| SyntaxError::new(format!("integer literal too large: {}", text), line))?
    };

    Ok((token, i))
}

fn scan_string(chars: &[char], start: usize, line: usize) -> Result<(String, usize), SyntaxError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' {
            let escaped = chars
                .get(i + 1)
                .ok_or_else(|| SyntaxError::new("unterminated string literal", line))?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' | '\'' | '"' => out.push(*escaped),
                other => {
                    out.push('\\');
                    out.push(*other);
                }
            }
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
    }

    Err(SyntaxError::new("unterminated string literal", line))
}
