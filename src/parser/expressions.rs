//! Expression parsing, lowest to highest precedence:
//! assignment, or, and, equality, comparison, additive, multiplicative,
//! unary, call/get, primary.

use crate::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use crate::error::ParserError;
use crate::lexer::TokenKind;

use super::core::{ParseResult, Parser, NATIVE_NAMESPACES};

impl Parser {
    pub(crate) fn expression(&mut self) -> ParseResult<Expr> {
        self.assignment()
    }

    /// Assignment is right-associative; valid targets are variables and
    /// indexed elements.
    fn assignment(&mut self) -> ParseResult<Expr> {
        let expr = self.logical_or()?;

        if self.match_token(&TokenKind::Equal) {
            let equal_span = self.previous_span();
            let value = self.assignment()?;

            return match expr.kind {
                ExprKind::Variable(_) | ExprKind::Index { .. } => {
                    let span = expr.span.merge(&value.span);
                    Ok(Expr::new(
                        ExprKind::Assign {
                            target: Box::new(expr),
                            value: Box::new(value),
                        },
                        span,
                    ))
                }
                _ => Err(ParserError::InvalidAssignmentTarget(equal_span)),
            };
        }

        Ok(expr)
    }

    fn logical_or(&mut self) -> ParseResult<Expr> {
        let mut expr = self.logical_and()?;

        while self.match_token(&TokenKind::Or) {
            let right = self.logical_and()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::LogicalOr {
                    left: Box::new(expr),
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn logical_and(&mut self) -> ParseResult<Expr> {
        let mut expr = self.equality()?;

        while self.match_token(&TokenKind::And) {
            let right = self.equality()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::LogicalAnd {
                    left: Box::new(expr),
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn equality(&mut self) -> ParseResult<Expr> {
        let mut expr = self.comparison()?;

        loop {
            let operator = if self.match_token(&TokenKind::EqualEqual) {
                BinaryOp::Equal
            } else if self.match_token(&TokenKind::BangEqual) {
                BinaryOp::NotEqual
            } else {
                break;
            };

            let right = self.comparison()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::Binary {
                    left: Box::new(expr),
                    operator,
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn comparison(&mut self) -> ParseResult<Expr> {
        let mut expr = self.term()?;

        loop {
            let operator = if self.match_token(&TokenKind::Greater) {
                BinaryOp::Greater
            } else if self.match_token(&TokenKind::GreaterEqual) {
                BinaryOp::GreaterEqual
            } else if self.match_token(&TokenKind::Less) {
                BinaryOp::Less
            } else if self.match_token(&TokenKind::LessEqual) {
                BinaryOp::LessEqual
            } else {
                break;
            };

            let right = self.term()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::Binary {
                    left: Box::new(expr),
                    operator,
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut expr = self.factor()?;

        loop {
            let operator = if self.match_token(&TokenKind::Plus) {
                BinaryOp::Add
            } else if self.match_token(&TokenKind::Minus) {
                BinaryOp::Subtract
            } else {
                break;
            };

            let right = self.factor()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::Binary {
                    left: Box::new(expr),
                    operator,
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn factor(&mut self) -> ParseResult<Expr> {
        let mut expr = self.unary()?;

        loop {
            let operator = if self.match_token(&TokenKind::Star) {
                BinaryOp::Multiply
            } else if self.match_token(&TokenKind::Slash) {
                BinaryOp::Divide
            } else if self.match_token(&TokenKind::Percent) {
                BinaryOp::Modulo
            } else {
                break;
            };

            let right = self.unary()?;
            let span = expr.span.merge(&right.span);
            expr = Expr::new(
                ExprKind::Binary {
                    left: Box::new(expr),
                    operator,
                    right: Box::new(right),
                },
                span,
            );
        }

        Ok(expr)
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        let operator = if self.match_token(&TokenKind::Bang) {
            Some(UnaryOp::Not)
        } else if self.match_token(&TokenKind::Minus) {
            Some(UnaryOp::Negate)
        } else {
            None
        };

        if let Some(operator) = operator {
            let op_span = self.previous_span();
            let operand = self.unary()?;
            let span = op_span.merge(&operand.span);
            return Ok(Expr::new(
                ExprKind::Unary {
                    operator,
                    operand: Box::new(operand),
                },
                span,
            ));
        }

        self.call()
    }

    /// Call/get level: `f(args)`, `Object.method(args)`, `arr[index]`.
    fn call(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;

        loop {
            if self.match_token(&TokenKind::LeftParen) {
                expr = self.finish_call(expr, None)?;
            } else if self.match_token(&TokenKind::Dot) {
                let name = self.expect_identifier("method name after '.'")?;
                self.expect(&TokenKind::LeftParen, "'(' after method name")?;
                expr = self.finish_call(expr, Some(name))?;
            } else if self.match_token(&TokenKind::LeftBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RightBracket, "']' after index")?;
                let span = expr.span.merge(&self.previous_span());
                expr = Expr::new(
                    ExprKind::Index {
                        array: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// The opening paren has been consumed. `method` is `Some` for a
    /// dotted call, in which case `callee` names the qualifier.
    fn finish_call(&mut self, callee: Expr, method: Option<String>) -> ParseResult<Expr> {
        let mut arguments = Vec::new();

        if !self.check(&TokenKind::RightParen) {
            loop {
                arguments.push(self.expression()?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(&TokenKind::RightParen, "')' after arguments")?;
        let span = callee.span.merge(&self.previous_span());

        let ExprKind::Variable(callee_name) = callee.kind else {
            return Err(ParserError::general("Invalid call target", callee.span));
        };

        match method {
            Some(method_name) => {
                let is_native = NATIVE_NAMESPACES.contains(&callee_name.as_str());
                Ok(Expr::new(
                    ExprKind::Call {
                        module: Some(callee_name),
                        name: method_name,
                        arguments,
                        is_native,
                    },
                    span,
                ))
            }
            None => Ok(Expr::new(
                ExprKind::Call {
                    module: None,
                    name: callee_name,
                    arguments,
                    is_native: false,
                },
                span,
            )),
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        let span = self.current_span();

        let kind = match &self.peek().kind {
            TokenKind::IntLiteral(n) => {
                let n = *n;
                self.advance();
                ExprKind::IntLiteral(n)
            }
            TokenKind::FloatLiteral(n) => {
                let n = *n;
                self.advance();
                ExprKind::FloatLiteral(n)
            }
            TokenKind::StringLiteral(s) => {
                let s = s.clone();
                self.advance();
                ExprKind::StringLiteral(s)
            }
            TokenKind::True => {
                self.advance();
                ExprKind::BoolLiteral(true)
            }
            TokenKind::False => {
                self.advance();
                ExprKind::BoolLiteral(false)
            }
            TokenKind::Nil => {
                self.advance();
                ExprKind::Nil
            }
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                ExprKind::Variable(name)
            }
            TokenKind::LeftParen => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&TokenKind::RightParen, "')' after expression")?;
                return Ok(expr);
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut elements = Vec::new();
                if !self.check(&TokenKind::RightBracket) {
                    loop {
                        elements.push(self.expression()?);
                        if !self.match_token(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RightBracket, "']' after array elements")?;
                let span = span.merge(&self.previous_span());
                return Ok(Expr::new(ExprKind::Array(elements), span));
            }
            kind => {
                return Err(ParserError::unexpected_token(
                    "expression",
                    format!("{}", kind),
                    span,
                ));
            }
        };

        Ok(Expr::new(kind, span))
    }
}
