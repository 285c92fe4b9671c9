use std::fmt;
use std::rc::Rc;

use crate::token::{format_float, Span};

/// A parsed source file: a flat sequence of statements.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    /// `x = expr` (the legacy `var` prefix parses to the same node).
    Assign { name: String, value: Expression },
    Expression(Expression),
    /// The `if`/`elif` chain as (condition, block) pairs, then `else`.
    If {
        branches: Vec<(Expression, Vec<Statement>)>,
        alternative: Option<Vec<Statement>>,
    },
    While {
        condition: Expression,
        body: Vec<Statement>,
    },
    For {
        variable: String,
        iterable: Expression,
        body: Vec<Statement>,
    },
    /// `def` / `async def`. The body is shared with closures built from it.
    FunctionDecl {
        name: String,
        parameters: Vec<String>,
        body: Rc<Vec<Statement>>,
        is_async: bool,
    },
    Return(Option<Expression>),
    Raise(Expression),
    Try {
        body: Vec<Statement>,
        handlers: Vec<ExceptClause>,
        finally: Option<Vec<Statement>>,
    },
    Import(ImportTarget),
    Block(Vec<Statement>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExceptClause {
    /// The error tag this clause catches (`Error` catches everything).
    pub kind_name: String,
    /// The `as e` binding, if present.
    pub binding: Option<String>,
    pub body: Vec<Statement>,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ImportTarget {
    /// `import utils`
    Name(String),
    /// `import "lib/utils"`
    Path(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    Null,
    Identifier(String),
    List(Vec<Expression>),
    Prefix(PrefixOperator, Box<Expression>),
    Infix(InfixOperator, Box<Expression>, Box<Expression>),
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Attribute {
        object: Box<Expression>,
        name: String,
    },
    Await(Box<Expression>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixOperator {
    Minus,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfixOperator {
    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    In,
    NotIn,
    Is,
    IsNot,
}

impl fmt::Display for PrefixOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PrefixOperator::Minus => write!(f, "-"),
            PrefixOperator::Not => write!(f, "not"),
        }
    }
}

impl fmt::Display for InfixOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            InfixOperator::Plus => "+",
            InfixOperator::Minus => "-",
            InfixOperator::Asterisk => "*",
            InfixOperator::Slash => "/",
            InfixOperator::Percent => "%",
            InfixOperator::Eq => "==",
            InfixOperator::NotEq => "!=",
            InfixOperator::Lt => "<",
            InfixOperator::Gt => ">",
            InfixOperator::Le => "<=",
            InfixOperator::Ge => ">=",
            InfixOperator::And => "and",
            InfixOperator::Or => "or",
            InfixOperator::In => "in",
            InfixOperator::NotIn => "not in",
            InfixOperator::Is => "is",
            InfixOperator::IsNot => "is not",
        };
        write!(f, "{}", s)
    }
}

// The pretty-printer produces source that parses back to the same tree,
// which is what the parser round-trip tests rely on. Every infix expression
// is fully parenthesised so precedence never has to be reconstructed.

fn write_block(f: &mut fmt::Formatter, statements: &[Statement]) -> fmt::Result {
    write!(f, "{{")?;
    for (i, stmt) in statements.iter().enumerate() {
        if i > 0 {
            write!(f, ";")?;
        }
        write!(f, " {}", stmt)?;
    }
    write!(f, " }}")
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for stmt in &self.statements {
            writeln!(f, "{}", stmt)?;
        }
        Ok(())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            StmtKind::Assign { name, value } => write!(f, "{} = {}", name, value),
            StmtKind::Expression(expr) => write!(f, "{}", expr),
            StmtKind::If {
                branches,
                alternative,
            } => {
                for (i, (condition, block)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { " elif" };
                    write!(f, "{} ({}) ", keyword, condition)?;
                    write_block(f, block)?;
                }
                if let Some(block) = alternative {
                    write!(f, " else ")?;
                    write_block(f, block)?;
                }
                Ok(())
            }
            StmtKind::While { condition, body } => {
                write!(f, "while ({}) ", condition)?;
                write_block(f, body)
            }
            StmtKind::For {
                variable,
                iterable,
                body,
            } => {
                write!(f, "for ({} in {}) ", variable, iterable)?;
                write_block(f, body)
            }
            StmtKind::FunctionDecl {
                name,
                parameters,
                body,
                is_async,
            } => {
                if *is_async {
                    write!(f, "async ")?;
                }
                write!(f, "def {}({}) ", name, parameters.join(", "))?;
                write_block(f, body)
            }
            StmtKind::Return(None) => write!(f, "return"),
            StmtKind::Return(Some(expr)) => write!(f, "return {}", expr),
            StmtKind::Raise(expr) => write!(f, "raise {}", expr),
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                write!(f, "try ")?;
                write_block(f, body)?;
                for clause in handlers {
                    write!(f, " except {}", clause.kind_name)?;
                    if let Some(binding) = &clause.binding {
                        write!(f, " as {}", binding)?;
                    }
                    write!(f, " ")?;
                    write_block(f, &clause.body)?;
                }
                if let Some(block) = finally {
                    write!(f, " finally ")?;
                    write_block(f, block)?;
                }
                Ok(())
            }
            StmtKind::Import(ImportTarget::Name(name)) => write!(f, "import {}", name),
            StmtKind::Import(ImportTarget::Path(path)) => {
                write!(f, "import \"{}\"", escape(path))
            }
            StmtKind::Block(statements) => write_block(f, statements),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ExprKind::Integer(v) => write!(f, "{}", v),
            ExprKind::Float(v) => write!(f, "{}", format_float(*v)),
            ExprKind::Str(s) => write!(f, "\"{}\"", escape(s)),
            ExprKind::Boolean(b) => write!(f, "{}", b),
            ExprKind::Null => write!(f, "null"),
            ExprKind::Identifier(name) => write!(f, "{}", name),
            ExprKind::List(elements) => {
                write!(f, "[")?;
                for (i, e) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            ExprKind::Prefix(op, operand) => match op {
                PrefixOperator::Minus => write!(f, "(-{})", operand),
                PrefixOperator::Not => write!(f, "(not {})", operand),
            },
            ExprKind::Infix(op, left, right) => write!(f, "({} {} {})", left, op, right),
            ExprKind::Call { callee, arguments } => {
                write!(f, "{}(", callee)?;
                for (i, a) in arguments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            ExprKind::Index { object, index } => write!(f, "{}[{}]", object, index),
            ExprKind::Attribute { object, name } => write!(f, "{}.{}", object, name),
            ExprKind::Await(operand) => write!(f, "(await {})", operand),
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}
