//! Scanner for Tail source code.
//!
//! Errors are accumulated rather than thrown: the scanner always produces a
//! token stream ending in `Eof`, and the caller checks the error list before
//! going on to parse.

use crate::error::LexerError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// The scanner transforms a source buffer into a stream of tokens.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
    errors: Vec<LexerError>,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
            errors: Vec::new(),
        }
    }

    /// Scan the whole buffer. Returns the token stream (always terminated by
    /// an `Eof` token) together with any errors encountered along the way.
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<LexerError>) {
        let mut tokens = Vec::new();

        loop {
            match self.scan_token() {
                Some(token) => {
                    let is_eof = token.kind == TokenKind::Eof;
                    tokens.push(token);
                    if is_eof {
                        break;
                    }
                }
                // An error was recorded; keep scanning.
                None => continue,
            }
        }

        (tokens, self.errors)
    }

    fn scan_token(&mut self) -> Option<Token> {
        self.skip_whitespace_and_comments();
        self.mark_start();

        let Some((_, c)) = self.advance() else {
            return Some(Token::eof(self.current_pos, self.line, self.column));
        };

        match c {
            '(' => Some(self.make_token(TokenKind::LeftParen)),
            ')' => Some(self.make_token(TokenKind::RightParen)),
            '{' => Some(self.make_token(TokenKind::LeftBrace)),
            '}' => Some(self.make_token(TokenKind::RightBrace)),
            '[' => Some(self.make_token(TokenKind::LeftBracket)),
            ']' => Some(self.make_token(TokenKind::RightBracket)),
            ',' => Some(self.make_token(TokenKind::Comma)),
            '.' => Some(self.make_token(TokenKind::Dot)),
            ';' => Some(self.make_token(TokenKind::Semicolon)),
            ':' => Some(self.make_token(TokenKind::Colon)),

            '!' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::BangEqual))
                } else {
                    Some(self.make_token(TokenKind::Bang))
                }
            }
            '=' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::EqualEqual))
                } else {
                    Some(self.make_token(TokenKind::Equal))
                }
            }
            '>' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::GreaterEqual))
                } else {
                    Some(self.make_token(TokenKind::Greater))
                }
            }
            '<' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::LessEqual))
                } else {
                    Some(self.make_token(TokenKind::Less))
                }
            }
            '+' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::PlusEqual))
                } else {
                    Some(self.make_token(TokenKind::Plus))
                }
            }
            '-' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::MinusEqual))
                } else {
                    Some(self.make_token(TokenKind::Minus))
                }
            }
            '*' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::StarEqual))
                } else {
                    Some(self.make_token(TokenKind::Star))
                }
            }
            '/' => {
                // `//` comments are consumed by skip_whitespace_and_comments,
                // so a slash here is always an operator.
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::SlashEqual))
                } else {
                    Some(self.make_token(TokenKind::Slash))
                }
            }
            '%' => {
                if self.match_char('=') {
                    Some(self.make_token(TokenKind::PercentEqual))
                } else {
                    Some(self.make_token(TokenKind::Percent))
                }
            }

            '"' => self.scan_string(),

            c if c.is_ascii_digit() => self.scan_number(),

            c if c.is_alphabetic() || c == '_' => Some(self.scan_identifier()),

            _ => {
                self.errors
                    .push(LexerError::UnexpectedChar(c, self.current_span()));
                None
            }
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(' ' | '\t' | '\r') => {
                    self.advance();
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some('/') => {
                    if self.peek_next() == Some('/') {
                        while self.peek().is_some() && self.peek() != Some('\n') {
                            self.advance();
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// Scan a double-quoted string with `\n \t \r \" \\` escapes. An
    /// unterminated string records an error and resumes from the next line.
    fn scan_string(&mut self) -> Option<Token> {
        let mut value = String::new();

        loop {
            match self.peek() {
                None => {
                    self.errors
                        .push(LexerError::UnterminatedString(self.current_span()));
                    return None;
                }
                Some('\n') => {
                    self.errors
                        .push(LexerError::UnterminatedString(self.current_span()));
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                    return None;
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek() {
                        Some('n') => {
                            self.advance();
                            value.push('\n');
                        }
                        Some('t') => {
                            self.advance();
                            value.push('\t');
                        }
                        Some('r') => {
                            self.advance();
                            value.push('\r');
                        }
                        Some('"') => {
                            self.advance();
                            value.push('"');
                        }
                        Some('\\') => {
                            self.advance();
                            value.push('\\');
                        }
                        Some(c) => {
                            // Unknown escape passes through verbatim.
                            self.advance();
                            value.push('\\');
                            value.push(c);
                        }
                        None => {
                            self.errors
                                .push(LexerError::UnterminatedString(self.current_span()));
                            return None;
                        }
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        Some(self.make_token(TokenKind::StringLiteral(value)))
    }

    /// Scan a decimal number. A `.` followed by a digit re-classifies it as a
    /// float; a trailing dot is left for the call/get production.
    fn scan_number(&mut self) -> Option<Token> {
        let mut is_float = false;

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && !is_float {
                match self.peek_next() {
                    Some(next) if next.is_ascii_digit() => {
                        is_float = true;
                        self.advance();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        let text = &self.source[self.start_pos..self.current_pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(n) => Some(self.make_token(TokenKind::FloatLiteral(n))),
                Err(_) => {
                    self.errors
                        .push(LexerError::InvalidNumber(text.to_string(), self.current_span()));
                    None
                }
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => Some(self.make_token(TokenKind::IntLiteral(n))),
                Err(_) => {
                    self.errors
                        .push(LexerError::InvalidNumber(text.to_string(), self.current_span()));
                    None
                }
            }
        }
    }

    fn scan_identifier(&mut self) -> Token {
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[self.start_pos..self.current_pos];
        let kind =
            TokenKind::keyword(text).unwrap_or_else(|| TokenKind::Identifier(text.to_string()));
        self.make_token(kind)
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        if let Some((pos, c)) = self.chars.next() {
            self.current_pos = pos + c.len_utf8();
            self.column += 1;
            Some((pos, c))
        } else {
            None
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.source[self.current_pos..].chars();
        iter.next();
        iter.next()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn current_span(&self) -> Span {
        Span::new(
            self.start_pos,
            self.current_pos,
            self.start_line,
            self.start_column,
        )
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.current_span())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = Scanner::new(source).tokenize();
        assert!(errors.is_empty(), "unexpected lex errors: {:?}", errors);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    fn scan_errors(source: &str) -> Vec<LexerError> {
        Scanner::new(source).tokenize().1
    }

    #[test]
    fn test_punctuation() {
        assert_eq!(
            scan("(){}[],.;:"),
            vec![
                TokenKind::LeftParen,
                TokenKind::RightParen,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::LeftBracket,
                TokenKind::RightBracket,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Semicolon,
                TokenKind::Colon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            scan("42 3.14"),
            vec![
                TokenKind::IntLiteral(42),
                TokenKind::FloatLiteral(3.14),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_trailing_dot_is_not_a_float() {
        assert_eq!(
            scan("1.foo"),
            vec![
                TokenKind::IntLiteral(1),
                TokenKind::Dot,
                TokenKind::Identifier("foo".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_minus_is_never_part_of_a_number() {
        assert_eq!(
            scan("-5"),
            vec![TokenKind::Minus, TokenKind::IntLiteral(5), TokenKind::Eof]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            scan(r#""a\nb\t\"c\\""#),
            vec![
                TokenKind::StringLiteral("a\nb\t\"c\\".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            scan("fn if else while mut unmut include byte"),
            vec![
                TokenKind::Fn,
                TokenKind::If,
                TokenKind::Else,
                TokenKind::While,
                TokenKind::Mut,
                TokenKind::Unmut,
                TokenKind::Include,
                TokenKind::Byte,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            scan("== != <= >= += -= *= /= %="),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
                TokenKind::PercentEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            scan("1 // comment\n2"),
            vec![
                TokenKind::IntLiteral(1),
                TokenKind::IntLiteral(2),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string_recovers_on_next_line() {
        let (tokens, errors) = Scanner::new("\"oops\n42").tokenize();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LexerError::UnterminatedString(_)));
        let kinds: Vec<TokenKind> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::IntLiteral(42), TokenKind::Eof]);
    }

    #[test]
    fn test_unknown_characters_accumulate() {
        let errors = scan_errors("@ # 1");
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_line_tracking() {
        let (tokens, _) = Scanner::new("a\nb").tokenize();
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 2);
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        let errors = scan_errors("99999999999999999999");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], LexerError::InvalidNumber(_, _)));
    }
}
