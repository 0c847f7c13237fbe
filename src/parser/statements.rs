//! Statement parsing: declarations, control flow, blocks.

use crate::ast::{FunctionDecl, Parameter, Stmt, StmtKind, TypeName};
use crate::error::ParserError;
use crate::lexer::TokenKind;

use super::core::{ParseResult, Parser};

impl Parser {
    pub(crate) fn statement(&mut self) -> ParseResult<Stmt> {
        if self.check(&TokenKind::If) {
            self.if_statement()
        } else if self.check(&TokenKind::While) {
            self.while_statement()
        } else if self.check(&TokenKind::For) {
            self.for_statement()
        } else if self.check(&TokenKind::Return) {
            self.return_statement()
        } else if self.check(&TokenKind::Break) {
            self.break_statement()
        } else if self.check(&TokenKind::Continue) {
            self.continue_statement()
        } else if self.check(&TokenKind::LeftBrace) {
            self.block_statement()
        } else if self.starts_declaration() {
            self.var_or_array_declaration()
        } else {
            self.expression_statement()
        }
    }

    /// A declaration begins with an optional `unmut`/`mut` prefix followed by
    /// a type keyword.
    fn starts_declaration(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Unmut | TokenKind::Mut => self.peek_nth(1).kind.is_type(),
            kind => kind.is_type(),
        }
    }

    /// Parse `mut int x = e;` or `int a[n] = e;`. Within the declaration, a
    /// name followed by `[` selects the array form.
    pub(crate) fn var_or_array_declaration(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();

        let mut mutable = true;
        if self.match_token(&TokenKind::Unmut) {
            mutable = false;
        } else if self.match_token(&TokenKind::Mut) {
            mutable = true;
        }

        let ty = self.expect_type()?;
        let name = self.expect_identifier("variable name")?;

        if self.match_token(&TokenKind::LeftBracket) {
            // Array declaration: int a[size]; or int a[] = [...];
            let size = if !self.check(&TokenKind::RightBracket) {
                Some(self.expression()?)
            } else {
                None
            };
            self.expect(&TokenKind::RightBracket, "']' after array size")?;

            let initializer = if self.match_token(&TokenKind::Equal) {
                Some(self.expression()?)
            } else {
                None
            };

            self.expect(&TokenKind::Semicolon, "';' after array declaration")?;
            let span = start_span.merge(&self.previous_span());
            return Ok(Stmt::new(
                StmtKind::ArrayDecl {
                    ty,
                    name,
                    size,
                    initializer,
                },
                span,
            ));
        }

        let initializer = if self.match_token(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };

        self.expect(&TokenKind::Semicolon, "';' after variable declaration")?;
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(
            StmtKind::VarDecl {
                mutable,
                ty,
                name,
                initializer,
            },
            span,
        ))
    }

    fn expect_type(&mut self) -> ParseResult<TypeName> {
        let ty = match &self.peek().kind {
            TokenKind::Int => TypeName::Int,
            TokenKind::Float => TypeName::Float,
            TokenKind::Str => TypeName::Str,
            TokenKind::Bool => TypeName::Bool,
            TokenKind::Byte => TypeName::Byte,
            kind => {
                return Err(ParserError::unexpected_token(
                    "type name (int, float, str, bool, byte)",
                    format!("{}", kind),
                    self.current_span(),
                ));
            }
        };
        self.advance();
        Ok(ty)
    }

    pub(crate) fn function_declaration(&mut self) -> ParseResult<Stmt> {
        let start_span = self.previous_span();
        let name = self.expect_identifier("function name")?;

        self.expect(&TokenKind::LeftParen, "'(' after function name")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                let param_span = self.current_span();
                let ty = self.expect_type()?;
                let param_name = self.expect_identifier("parameter name")?;
                params.push(Parameter {
                    ty,
                    name: param_name,
                    span: param_span,
                });
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(&TokenKind::RightParen, "')' after parameters")?;
        self.expect(&TokenKind::LeftBrace, "'{' before function body")?;
        let body = self.block_statements()?;
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(
            StmtKind::Function(FunctionDecl {
                name,
                params,
                body,
                span,
            }),
            span,
        ))
    }

    fn if_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        self.expect(&TokenKind::If, "'if'")?;

        self.expect(&TokenKind::LeftParen, "'(' after 'if'")?;
        let condition = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after condition")?;

        let then_branch = Box::new(self.block_statement()?);

        let else_branch = if self.match_token(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(Box::new(self.if_statement()?))
            } else {
                Some(Box::new(self.block_statement()?))
            }
        } else {
            None
        };

        let span = start_span.merge(&self.previous_span());
        Ok(Stmt::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            span,
        ))
    }

    fn while_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        self.expect(&TokenKind::While, "'while'")?;

        self.expect(&TokenKind::LeftParen, "'(' after 'while'")?;
        let condition = self.expression()?;
        self.expect(&TokenKind::RightParen, "')' after condition")?;

        let body = Box::new(self.statement()?);
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(StmtKind::While { condition, body }, span))
    }

    fn for_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        self.expect(&TokenKind::For, "'for'")?;
        self.expect(&TokenKind::LeftParen, "'(' after 'for'")?;

        let initializer = if self.match_token(&TokenKind::Semicolon) {
            None
        } else if self.starts_declaration() {
            Some(Box::new(self.var_or_array_declaration()?))
        } else {
            let expr = self.expression()?;
            self.expect(&TokenKind::Semicolon, "';' after for initializer")?;
            let span = expr.span;
            Some(Box::new(Stmt::new(StmtKind::Expression(expr), span)))
        };

        let condition = if !self.check(&TokenKind::Semicolon) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "';' after for condition")?;

        let increment = if !self.check(&TokenKind::RightParen) {
            Some(self.expression()?)
        } else {
            None
        };
        self.expect(&TokenKind::RightParen, "')' after for clauses")?;

        let body = Box::new(self.statement()?);
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(
            StmtKind::For {
                initializer,
                condition,
                increment,
                body,
            },
            span,
        ))
    }

    fn return_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        self.expect(&TokenKind::Return, "'return'")?;

        let value = if !self.check(&TokenKind::Semicolon) {
            Some(self.expression()?)
        } else {
            None
        };

        self.expect(&TokenKind::Semicolon, "';' after return")?;
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(StmtKind::Return(value), span))
    }

    fn break_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.expect(&TokenKind::Break, "'break'")?;
        self.expect(&TokenKind::Semicolon, "';' after break")?;
        Ok(Stmt::new(StmtKind::Break, span))
    }

    fn continue_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current_span();
        self.expect(&TokenKind::Continue, "'continue'")?;
        self.expect(&TokenKind::Semicolon, "';' after continue")?;
        Ok(Stmt::new(StmtKind::Continue, span))
    }

    pub(crate) fn block_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        self.expect(&TokenKind::LeftBrace, "'{'")?;
        let statements = self.block_statements()?;
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(StmtKind::Block(statements), span))
    }

    /// Parse statements until the closing brace. The opening brace has
    /// already been consumed.
    pub(crate) fn block_statements(&mut self) -> ParseResult<Vec<Stmt>> {
        let mut statements = Vec::new();

        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            if let Some(stmt) = self.declaration()? {
                statements.push(stmt);
            }
        }

        self.expect(&TokenKind::RightBrace, "'}' after block")?;
        Ok(statements)
    }

    fn expression_statement(&mut self) -> ParseResult<Stmt> {
        let start_span = self.current_span();
        let expr = self.expression()?;
        self.expect(&TokenKind::Semicolon, "';' after expression")?;
        let span = start_span.merge(&self.previous_span());

        Ok(Stmt::new(StmtKind::Expression(expr), span))
    }
}
