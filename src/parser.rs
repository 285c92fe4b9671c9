use std::rc::Rc;

use crate::ast::{
    ExceptClause, ExprKind, Expression, ImportTarget, InfixOperator, PrefixOperator, Program,
    Statement, StmtKind,
};
use crate::error::{ErrorKind, Exception};
use crate::token::{Span, Token, TokenKind};

const NOT_HINT: &str = "Did you mean 'not in' or 'is not'?";

type Result<T> = std::result::Result<T, Exception>;

/// Recursive-descent parser with a precedence-climbing expression core.
///
/// Newlines are statement separators; inside parentheses, brackets, and after
/// an operator they are insignificant and skipped explicitly.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Parser {
        Parser { tokens, pos: 0 }
    }

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut statements = Vec::new();

        self.skip_separators();
        while self.cur_kind() != &TokenKind::Eof {
            statements.push(self.parse_statement()?);
            self.skip_separators();
        }

        Ok(Program { statements })
    }

    // ---- token plumbing -------------------------------------------------

    fn cur(&self) -> &Token {
        // The stream always ends in Eof, so the clamp is safe.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn cur_kind(&self) -> &TokenKind {
        &self.cur().kind
    }

    fn cur_span(&self) -> Span {
        self.cur().span
    }

    fn peek_kind(&self) -> &TokenKind {
        let i = (self.pos + 1).min(self.tokens.len() - 1);
        &self.tokens[i].kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.cur_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consumes `kind` even when newlines precede it; restores the position
    /// when it is not there. Used for clause keywords (`elif`, `except`, …)
    /// that may start a fresh line after a closing brace.
    fn eat_after_newlines(&mut self, kind: &TokenKind) -> bool {
        let saved = self.pos;
        self.skip_newlines();
        if self.eat(kind) {
            true
        } else {
            self.pos = saved;
            false
        }
    }

    fn skip_newlines(&mut self) {
        while self.cur_kind() == &TokenKind::Newline {
            self.advance();
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.cur_kind(), TokenKind::Newline | TokenKind::SemiColon) {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> Exception {
        Exception::new(ErrorKind::Syntax, message, self.cur_span())
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    // ---- statements -----------------------------------------------------

    fn parse_statement(&mut self) -> Result<Statement> {
        let span = self.cur_span();
        let kind = match self.cur_kind() {
            TokenKind::Var => {
                self.advance();
                self.parse_assignment()?
            }
            TokenKind::Ident(_) if self.peek_kind() == &TokenKind::Assign => {
                self.parse_assignment()?
            }
            TokenKind::Async => {
                self.advance();
                self.expect(&TokenKind::Def, "Expected 'def' after 'async'")?;
                self.parse_function_decl(true)?
            }
            TokenKind::Def => {
                self.advance();
                self.parse_function_decl(false)?
            }
            TokenKind::If => {
                self.advance();
                self.parse_if()?
            }
            TokenKind::While => {
                self.advance();
                self.parse_while()?
            }
            TokenKind::For => {
                self.advance();
                self.parse_for()?
            }
            TokenKind::Try => {
                self.advance();
                self.parse_try()?
            }
            TokenKind::Return => {
                self.advance();
                self.parse_return()?
            }
            TokenKind::Raise => {
                self.advance();
                let expr = self.parse_expression()?;
                StmtKind::Raise(expr)
            }
            TokenKind::Import => {
                self.advance();
                self.parse_import()?
            }
            TokenKind::OpenBrace => {
                self.advance();
                StmtKind::Block(self.parse_block_body()?)
            }
            // Historic statement form: run "file.vlang" without parentheses.
            TokenKind::Run | TokenKind::RunAsync if matches!(self.peek_kind(), TokenKind::Str(_)) => {
                self.parse_legacy_run()?
            }
            _ => StmtKind::Expression(self.parse_expression()?),
        };

        Ok(Statement { kind, span })
    }

    fn parse_assignment(&mut self) -> Result<StmtKind> {
        let name = self.parse_identifier_name("Expected variable name")?;
        self.expect(&TokenKind::Assign, "Expected '=' in assignment")?;
        self.skip_newlines();
        let value = self.parse_expression()?;
        Ok(StmtKind::Assign { name, value })
    }

    fn parse_identifier_name(&mut self, message: &str) -> Result<String> {
        if let TokenKind::Ident(name) = self.cur_kind() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(message))
        }
    }

    fn parse_function_decl(&mut self, is_async: bool) -> Result<StmtKind> {
        let name = self.parse_identifier_name(if is_async {
            "Expected function name after 'async def'"
        } else {
            "Expected function name after 'def'"
        })?;
        self.expect(&TokenKind::OpenParen, "Expected '(' after function name")?;
        self.skip_newlines();

        let mut parameters = Vec::new();
        if !self.eat(&TokenKind::CloseParen) {
            loop {
                parameters
                    .push(self.parse_identifier_name("Expected parameter name in function definition")?);
                self.skip_newlines();
                if self.eat(&TokenKind::Comma) {
                    self.skip_newlines();
                } else if self.eat(&TokenKind::CloseParen) {
                    break;
                } else {
                    return Err(self.error("Expected ',' or ')' in parameter list"));
                }
            }
        }

        self.skip_newlines();
        self.expect(&TokenKind::OpenBrace, "Expected '{' to start function body")?;
        let body = self.parse_block_body()?;

        Ok(StmtKind::FunctionDecl {
            name,
            parameters,
            body: Rc::new(body),
            is_async,
        })
    }

    fn parse_condition(&mut self, what: &str) -> Result<Expression> {
        self.expect(&TokenKind::OpenParen, &format!("Expected '(' after '{}'", what))?;
        self.skip_newlines();
        let condition = self.parse_expression()?;
        self.skip_newlines();
        if !self.eat(&TokenKind::CloseParen) {
            let mut err = self.error(format!("Expected ')' after {} condition", what));
            if self.cur_kind() == &TokenKind::Not {
                err = err.with_hint(NOT_HINT);
            }
            return Err(err);
        }
        Ok(condition)
    }

    fn parse_if(&mut self) -> Result<StmtKind> {
        let condition = self.parse_condition("if")?;
        self.skip_newlines();
        self.expect(&TokenKind::OpenBrace, "Expected '{' after if condition")?;
        let block = self.parse_block_body()?;

        let mut branches = vec![(condition, block)];
        while self.eat_after_newlines(&TokenKind::Elif) {
            let condition = self.parse_condition("elif")?;
            self.skip_newlines();
            self.expect(&TokenKind::OpenBrace, "Expected '{' after elif condition")?;
            branches.push((condition, self.parse_block_body()?));
        }

        let alternative = if self.eat_after_newlines(&TokenKind::Else) {
            self.skip_newlines();
            self.expect(&TokenKind::OpenBrace, "Expected '{' after 'else'")?;
            Some(self.parse_block_body()?)
        } else {
            None
        };

        Ok(StmtKind::If {
            branches,
            alternative,
        })
    }

    fn parse_while(&mut self) -> Result<StmtKind> {
        let condition = self.parse_condition("while")?;
        self.skip_newlines();
        self.expect(&TokenKind::OpenBrace, "Expected '{' after while condition")?;
        let body = self.parse_block_body()?;
        Ok(StmtKind::While { condition, body })
    }

    fn parse_for(&mut self) -> Result<StmtKind> {
        self.expect(&TokenKind::OpenParen, "Expected '(' after 'for'")?;
        self.skip_newlines();
        let variable = self.parse_identifier_name("Expected variable name in for loop")?;
        self.expect(&TokenKind::In, "Expected 'in' in for loop")?;
        self.skip_newlines();
        let iterable = self.parse_expression()?;
        self.skip_newlines();
        self.expect(&TokenKind::CloseParen, "Expected ')' after for loop header")?;
        self.skip_newlines();
        self.expect(&TokenKind::OpenBrace, "Expected '{' after for loop header")?;
        let body = self.parse_block_body()?;
        Ok(StmtKind::For {
            variable,
            iterable,
            body,
        })
    }

    fn parse_try(&mut self) -> Result<StmtKind> {
        self.skip_newlines();
        self.expect(&TokenKind::OpenBrace, "Expected '{' after 'try'")?;
        let body = self.parse_block_body()?;

        let mut handlers = Vec::new();
        while self.eat_after_newlines(&TokenKind::Except) {
            let span = self.cur_span();
            let kind_name =
                self.parse_identifier_name("Expected error name after 'except'")?;
            let binding = if self.eat(&TokenKind::As) {
                Some(self.parse_identifier_name("Expected variable name after 'as' in except block")?)
            } else {
                None
            };
            self.skip_newlines();
            self.expect(&TokenKind::OpenBrace, "Expected '{' after 'except' clause")?;
            handlers.push(ExceptClause {
                kind_name,
                binding,
                body: self.parse_block_body()?,
                span,
            });
        }
        if handlers.is_empty() {
            return Err(self.error("Expected 'except' after try block"));
        }

        let finally = if self.eat_after_newlines(&TokenKind::Finally) {
            self.skip_newlines();
            self.expect(&TokenKind::OpenBrace, "Expected '{' after 'finally'")?;
            Some(self.parse_block_body()?)
        } else {
            None
        };

        Ok(StmtKind::Try {
            body,
            handlers,
            finally,
        })
    }

    fn parse_return(&mut self) -> Result<StmtKind> {
        let value = match self.cur_kind() {
            TokenKind::Newline
            | TokenKind::SemiColon
            | TokenKind::CloseBrace
            | TokenKind::Eof => None,
            _ => Some(self.parse_expression()?),
        };
        Ok(StmtKind::Return(value))
    }

    fn parse_import(&mut self) -> Result<StmtKind> {
        let target = match self.cur_kind() {
            TokenKind::Ident(name) => ImportTarget::Name(name.clone()),
            TokenKind::Str(path) => ImportTarget::Path(path.clone()),
            _ => {
                return Err(
                    self.error("Expected module name (identifier or string) after 'import'")
                )
            }
        };
        self.advance();
        Ok(StmtKind::Import(target))
    }

    fn parse_legacy_run(&mut self) -> Result<StmtKind> {
        let callee_span = self.cur_span();
        let name = if self.cur_kind() == &TokenKind::Run {
            "run"
        } else {
            "run_async"
        };
        self.advance();

        let arg_span = self.cur_span();
        let path = match self.cur_kind() {
            TokenKind::Str(path) => path.clone(),
            _ => unreachable!("caller checked for a string literal"),
        };
        self.advance();

        Ok(StmtKind::Expression(Expression {
            kind: ExprKind::Call {
                callee: Box::new(Expression {
                    kind: ExprKind::Identifier(name.to_string()),
                    span: callee_span,
                }),
                arguments: vec![Expression {
                    kind: ExprKind::Str(path),
                    span: arg_span,
                }],
            },
            span: callee_span,
        }))
    }

    fn parse_block_body(&mut self) -> Result<Vec<Statement>> {
        let mut statements = Vec::new();

        self.skip_separators();
        while !self.eat(&TokenKind::CloseBrace) {
            if self.cur_kind() == &TokenKind::Eof {
                return Err(self.error("Unclosed block"));
            }
            statements.push(self.parse_statement()?);
            self.skip_separators();
        }

        Ok(statements)
    }

    // ---- expressions ----------------------------------------------------

    pub fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expression> {
        let mut node = self.parse_and()?;
        while self.cur_kind() == &TokenKind::Or {
            let span = node.span;
            self.advance();
            self.skip_newlines();
            let right = self.parse_and()?;
            node = infix(InfixOperator::Or, node, right, span);
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Expression> {
        let mut node = self.parse_not()?;
        while self.cur_kind() == &TokenKind::And {
            let span = node.span;
            self.advance();
            self.skip_newlines();
            let right = self.parse_not()?;
            node = infix(InfixOperator::And, node, right, span);
        }
        Ok(node)
    }

    fn parse_not(&mut self) -> Result<Expression> {
        if self.cur_kind() == &TokenKind::Not {
            let span = self.cur_span();
            self.advance();
            self.skip_newlines();
            let operand = self.parse_not().map_err(hinted)?;
            return Ok(Expression {
                kind: ExprKind::Prefix(PrefixOperator::Not, Box::new(operand)),
                span,
            });
        }
        self.parse_comparison()
    }

    /// The comparison tier is non-associative: at most one comparison,
    /// membership, or identity operator per (unparenthesised) expression.
    fn parse_comparison(&mut self) -> Result<Expression> {
        let node = self.parse_additive()?;

        let operator = match self.cur_kind() {
            TokenKind::Eq => InfixOperator::Eq,
            TokenKind::Ne => InfixOperator::NotEq,
            TokenKind::Lt => InfixOperator::Lt,
            TokenKind::Gt => InfixOperator::Gt,
            TokenKind::Le => InfixOperator::Le,
            TokenKind::Ge => InfixOperator::Ge,
            TokenKind::In => InfixOperator::In,
            TokenKind::Is => {
                if self.peek_kind() == &TokenKind::Not {
                    self.advance();
                    InfixOperator::IsNot
                } else {
                    InfixOperator::Is
                }
            }
            TokenKind::Not if self.peek_kind() == &TokenKind::In => {
                self.advance();
                InfixOperator::NotIn
            }
            _ => return Ok(node),
        };
        let span = node.span;
        self.advance();
        self.skip_newlines();

        let multi_word = matches!(operator, InfixOperator::IsNot | InfixOperator::NotIn);
        let right = match self.parse_additive() {
            Ok(right) => right,
            Err(err) if multi_word => return Err(hinted(err)),
            Err(err) => return Err(err),
        };
        Ok(infix(operator, node, right, span))
    }

    fn parse_additive(&mut self) -> Result<Expression> {
        let mut node = self.parse_term()?;
        loop {
            let operator = match self.cur_kind() {
                TokenKind::Plus => InfixOperator::Plus,
                TokenKind::Minus => InfixOperator::Minus,
                _ => return Ok(node),
            };
            let span = node.span;
            self.advance();
            self.skip_newlines();
            let right = self.parse_term()?;
            node = infix(operator, node, right, span);
        }
    }

    fn parse_term(&mut self) -> Result<Expression> {
        let mut node = self.parse_unary()?;
        loop {
            let operator = match self.cur_kind() {
                TokenKind::Asterisk => InfixOperator::Asterisk,
                TokenKind::Slash => InfixOperator::Slash,
                TokenKind::Percent => InfixOperator::Percent,
                _ => return Ok(node),
            };
            let span = node.span;
            self.advance();
            self.skip_newlines();
            let right = self.parse_unary()?;
            node = infix(operator, node, right, span);
        }
    }

    fn parse_unary(&mut self) -> Result<Expression> {
        let span = self.cur_span();
        match self.cur_kind() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression {
                    kind: ExprKind::Prefix(PrefixOperator::Minus, Box::new(operand)),
                    span,
                })
            }
            TokenKind::Await => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expression {
                    kind: ExprKind::Await(Box::new(operand)),
                    span,
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expression> {
        let mut node = self.parse_primary()?;

        loop {
            match self.cur_kind() {
                TokenKind::OpenParen => {
                    let span = node.span;
                    self.advance();
                    self.skip_newlines();
                    let arguments = self.parse_call_arguments()?;
                    node = Expression {
                        kind: ExprKind::Call {
                            callee: Box::new(node),
                            arguments,
                        },
                        span,
                    };
                }
                TokenKind::OpenBracket => {
                    let span = node.span;
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expression()?;
                    self.skip_newlines();
                    self.expect(&TokenKind::CloseBracket, "Expected ']' after index")?;
                    node = Expression {
                        kind: ExprKind::Index {
                            object: Box::new(node),
                            index: Box::new(index),
                        },
                        span,
                    };
                }
                TokenKind::Dot => {
                    let span = node.span;
                    self.advance();
                    let name = self.parse_identifier_name("Expected attribute name after '.'")?;
                    node = Expression {
                        kind: ExprKind::Attribute {
                            object: Box::new(node),
                            name,
                        },
                        span,
                    };
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_call_arguments(&mut self) -> Result<Vec<Expression>> {
        let mut arguments = Vec::new();

        if self.eat(&TokenKind::CloseParen) {
            return Ok(arguments);
        }
        loop {
            arguments.push(self.parse_expression()?);
            self.skip_newlines();
            if self.eat(&TokenKind::Comma) {
                self.skip_newlines();
            } else if self.eat(&TokenKind::CloseParen) {
                return Ok(arguments);
            } else {
                return Err(self.error("Expected ',' or ')' in function call"));
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expression> {
        let span = self.cur_span();
        let kind = match self.cur_kind() {
            TokenKind::Int(v) => ExprKind::Integer(*v),
            TokenKind::Float(v) => ExprKind::Float(*v),
            TokenKind::Str(s) => ExprKind::Str(s.clone()),
            TokenKind::True => ExprKind::Boolean(true),
            TokenKind::False => ExprKind::Boolean(false),
            TokenKind::Null => ExprKind::Null,
            TokenKind::Ident(name) => ExprKind::Identifier(name.clone()),
            // `run` / `run_async` are keywords but callable like builtins.
            TokenKind::Run => ExprKind::Identifier("run".to_string()),
            TokenKind::RunAsync => ExprKind::Identifier("run_async".to_string()),
            TokenKind::OpenParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.parse_expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::CloseParen, "Expected ')'")?;
                return Ok(expr);
            }
            TokenKind::OpenBracket => {
                self.advance();
                self.skip_newlines();
                return self.parse_list_literal(span);
            }
            TokenKind::Illegal(c) => {
                return Err(self.error(format!("Unexpected character: {}", c)));
            }
            other => {
                return Err(self.error(format!("Unexpected token: {}", other.describe())));
            }
        };
        self.advance();
        Ok(Expression { kind, span })
    }

    fn parse_list_literal(&mut self, span: Span) -> Result<Expression> {
        let mut elements = Vec::new();

        if !self.eat(&TokenKind::CloseBracket) {
            loop {
                elements.push(self.parse_expression()?);
                self.skip_newlines();
                if self.eat(&TokenKind::Comma) {
                    self.skip_newlines();
                    // Allow a trailing comma before the closing bracket.
                    if self.eat(&TokenKind::CloseBracket) {
                        break;
                    }
                } else if self.eat(&TokenKind::CloseBracket) {
                    break;
                } else {
                    return Err(self.error("Expected ',' or ']' in list literal"));
                }
            }
        }

        Ok(Expression {
            kind: ExprKind::List(elements),
            span,
        })
    }
}

fn infix(op: InfixOperator, left: Expression, right: Expression, span: Span) -> Expression {
    Expression {
        kind: ExprKind::Infix(op, Box::new(left), Box::new(right)),
        span,
    }
}

fn hinted(err: Exception) -> Exception {
    if err.hint.is_none() {
        err.with_hint(NOT_HINT)
    } else {
        err
    }
}
