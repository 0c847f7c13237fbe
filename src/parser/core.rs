//! Core parser struct, token helpers and error recovery.

use indexmap::IndexMap;

use crate::ast::{Program, Stmt};
use crate::error::ParserError;
use crate::lexer::{Token, TokenKind};
use crate::span::Span;

pub type ParseResult<T> = Result<T, ParserError>;

/// Reserved capability namespaces. A call through one of these is a native
/// call; any other qualifier is a module-qualified call.
pub(crate) const NATIVE_NAMESPACES: [&str; 6] =
    ["Console", "Math", "String", "Array", "File", "System"];

/// The parser for Tail. LL(1) with panic-mode recovery: errors are collected
/// in a list and each one synchronizes to the next statement boundary.
pub struct Parser {
    pub(crate) tokens: Vec<Token>,
    pub(crate) current: usize,
    errors: Vec<ParserError>,
    includes: IndexMap<String, Span>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            errors: Vec::new(),
            includes: IndexMap::new(),
        }
    }

    /// Parse a complete source file. Include directives are recorded in the
    /// include map and elided from the statement list.
    pub fn parse(&mut self) -> Program {
        let mut statements = Vec::new();

        while !self.is_at_end() {
            match self.declaration() {
                Ok(Some(stmt)) => statements.push(stmt),
                Ok(None) => {}
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                }
            }
        }

        Program::new(statements)
    }

    /// Errors collected during parsing.
    pub fn errors(&self) -> &[ParserError] {
        &self.errors
    }

    /// Include directives seen in this file, in source order.
    pub fn includes(&self) -> &IndexMap<String, Span> {
        &self.includes
    }

    pub(crate) fn record_include(&mut self, name: String, span: Span) {
        self.includes.entry(name).or_insert(span);
    }

    /// Skip forward to a likely statement boundary after an error.
    fn synchronize(&mut self) {
        self.advance();

        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }

            match self.peek().kind {
                TokenKind::Fn
                | TokenKind::If
                | TokenKind::For
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Include => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ===== Token manipulation =====

    pub(crate) fn advance(&mut self) -> Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.tokens[self.current - 1].clone()
    }

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    pub(crate) fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    pub(crate) fn peek_nth(&self, n: usize) -> &Token {
        let index = if self.current + n < self.tokens.len() {
            self.current + n
        } else {
            self.tokens.len() - 1
        };
        &self.tokens[index]
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn check(&self, kind: &TokenKind) -> bool {
        if self.is_at_end() {
            false
        } else {
            std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
        }
    }

    pub(crate) fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn expect(&mut self, kind: &TokenKind, expected: &str) -> ParseResult<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ParserError::unexpected_token(
                expected,
                format!("{}", self.peek().kind),
                self.current_span(),
            ))
        }
    }

    pub(crate) fn expect_identifier(&mut self, expected: &str) -> ParseResult<String> {
        match &self.peek().kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(ParserError::unexpected_token(
                expected,
                format!("{}", self.peek().kind),
                self.current_span(),
            )),
        }
    }

    pub(crate) fn current_span(&self) -> Span {
        self.peek().span
    }

    pub(crate) fn previous_span(&self) -> Span {
        self.previous().span
    }

    /// Parse a top-level declaration: a statement, or `None` for an elided
    /// include directive.
    pub(crate) fn declaration(&mut self) -> ParseResult<Option<Stmt>> {
        if self.match_token(&TokenKind::Include) {
            self.include_directive()?;
            return Ok(None);
        }
        if self.match_token(&TokenKind::Fn) {
            return Ok(Some(self.function_declaration()?));
        }
        Ok(Some(self.statement()?))
    }

    fn include_directive(&mut self) -> ParseResult<()> {
        let span = self.current_span();
        let name = self.expect_identifier("library name after 'include'")?;
        self.expect(&TokenKind::Semicolon, "';' after include")?;
        self.record_include(name, span);
        Ok(())
    }
}
