use std::cell::RefCell;
use std::io::Write;
use std::mem;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;
use std::time::Instant;

use crate::ast::{
    ExprKind, Expression, InfixOperator, PrefixOperator, Program, Statement, StmtKind,
};
use crate::error::{ErrorKind, Exception, SourceMap};
use crate::lexer::Lexer;
use crate::modules::ModuleCache;
use crate::object::{builtins, compare, Env, EvalResult, Function, Key, Value};
use crate::parser::Parser;
use crate::scheduler::{Scheduler, TaskKind, TaskRef, TaskState};
use crate::token::Span;

/// The control-flow outcome of a statement. Raised errors travel as the
/// `Err` side of the evaluation `Result`.
#[derive(Debug)]
pub enum Signal {
    Normal(Value),
    Return(Value),
}

/// One interpreter instance: a global frame with the builtin overlay, a
/// source map for diagnostics, a module cache, and a task scheduler. All of
/// it is per-instance so several interpreters can coexist in one process.
pub struct Interpreter {
    pub globals: Env,
    pub sources: SourceMap,
    pub scheduler: Scheduler,
    pub modules: ModuleCache,
    /// Directory of the currently executing script, appended to the import
    /// search path.
    pub script_dir: Option<PathBuf>,
    output: Rc<RefCell<dyn Write>>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Interpreter::new()
    }
}

impl Interpreter {
    pub fn new() -> Interpreter {
        let globals = Env::global();
        builtins::install(&globals);
        Interpreter {
            globals,
            sources: SourceMap::new(),
            scheduler: Scheduler::new(),
            modules: ModuleCache::new(),
            script_dir: None,
            output: Rc::new(RefCell::new(std::io::stdout())),
        }
    }

    /// Redirects `print` output, mainly for tests.
    pub fn set_output(&mut self, sink: Rc<RefCell<dyn Write>>) {
        self.output = sink;
    }

    pub fn write_line(&mut self, line: &str) {
        let mut out = self.output.borrow_mut();
        let _ = writeln!(out, "{}", line);
    }

    pub fn write_str(&mut self, text: &str) {
        let mut out = self.output.borrow_mut();
        let _ = write!(out, "{}", text);
        let _ = out.flush();
    }

    /// Parses and evaluates a buffer in the global frame, returning the
    /// value of the last statement.
    pub fn eval_source(&mut self, source: &str, name: &str) -> EvalResult {
        let file = self.sources.add(name, source);
        let tokens = Lexer::new(source, file).tokenize()?;
        let program = Parser::new(tokens).parse_program()?;
        self.eval_program(&program)
    }

    pub fn eval_program(&mut self, program: &Program) -> EvalResult {
        let globals = self.globals.clone();
        match self.eval_block(&program.statements, &globals)? {
            Signal::Normal(value) => Ok(value),
            // A top-level `return` completes the program with its value.
            Signal::Return(value) => Ok(value),
        }
    }

    /// Runs remaining ready tasks, then reports failures nobody awaited.
    pub fn finish(&mut self) -> Vec<Exception> {
        while let Some(task) = self.scheduler.pop_ready() {
            self.run_task(&task);
        }
        self.scheduler.unobserved_failures()
    }

    // ---- statements -----------------------------------------------------

    pub fn eval_block(
        &mut self,
        statements: &[Statement],
        env: &Env,
    ) -> Result<Signal, Exception> {
        let mut result = Signal::Normal(Value::Null);
        for statement in statements {
            result = self.eval_statement(statement, env)?;
            if let Signal::Return(_) = result {
                return Ok(result);
            }
        }
        Ok(result)
    }

    fn eval_statement(&mut self, statement: &Statement, env: &Env) -> Result<Signal, Exception> {
        match &statement.kind {
            StmtKind::Assign { name, value } => {
                let value = self.eval_expression(value, env)?;
                env.assign(name, value.clone());
                Ok(Signal::Normal(value))
            }
            StmtKind::Expression(expr) => {
                Ok(Signal::Normal(self.eval_expression(expr, env)?))
            }
            StmtKind::If {
                branches,
                alternative,
            } => {
                for (condition, block) in branches {
                    if self.eval_expression(condition, env)?.is_truthy() {
                        return self.eval_block(block, env);
                    }
                }
                match alternative {
                    Some(block) => self.eval_block(block, env),
                    None => Ok(Signal::Normal(Value::Null)),
                }
            }
            StmtKind::While { condition, body } => {
                while self.eval_expression(condition, env)?.is_truthy() {
                    if let Signal::Return(value) = self.eval_block(body, env)? {
                        return Ok(Signal::Return(value));
                    }
                }
                Ok(Signal::Normal(Value::Null))
            }
            StmtKind::For {
                variable,
                iterable,
                body,
            } => {
                let source = self.eval_expression(iterable, env)?;
                let elements = builtins::iter_elements(&source).ok_or_else(|| {
                    Exception::new(
                        ErrorKind::Type,
                        format!("'{}' is not iterable", source.type_name()),
                        iterable.span,
                    )
                })?;
                for element in elements {
                    env.assign(variable, element);
                    if let Signal::Return(value) = self.eval_block(body, env)? {
                        return Ok(Signal::Return(value));
                    }
                }
                Ok(Signal::Normal(Value::Null))
            }
            StmtKind::FunctionDecl {
                name,
                parameters,
                body,
                is_async,
            } => {
                let function = Value::Function(Rc::new(Function {
                    name: name.clone(),
                    parameters: parameters.clone(),
                    body: Rc::clone(body),
                    env: env.clone(),
                    is_async: *is_async,
                }));
                env.assign(name, function);
                Ok(Signal::Normal(Value::Null))
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval_expression(expr, env)?,
                    None => Value::Null,
                };
                Ok(Signal::Return(value))
            }
            StmtKind::Raise(expr) => {
                let value = self.eval_expression(expr, env)?;
                match value {
                    Value::Error(error) => {
                        let mut exception = (*error).clone();
                        if exception.span.is_none() {
                            exception.span = Some(statement.span);
                        } else {
                            exception.push_trace(statement.span);
                        }
                        Err(exception)
                    }
                    other => Err(Exception::new(
                        ErrorKind::Type,
                        format!("exceptions must be error values, not '{}'", other.type_name()),
                        statement.span,
                    )),
                }
            }
            StmtKind::Try {
                body,
                handlers,
                finally,
            } => {
                let outcome = match self.eval_block(body, env) {
                    Err(exception) => {
                        let handler = handlers
                            .iter()
                            .find(|clause| exception.kind.matches(&clause.kind_name));
                        match handler {
                            Some(clause) => {
                                if let Some(binding) = &clause.binding {
                                    env.assign(binding, Value::Error(Rc::new(exception)));
                                }
                                self.eval_block(&clause.body, env)
                            }
                            None => Err(exception),
                        }
                    }
                    ok => ok,
                };

                if let Some(block) = finally {
                    // A raise or return inside `finally` replaces whatever
                    // signal was pending.
                    if let Signal::Return(value) = self.eval_block(block, env)? {
                        return Ok(Signal::Return(value));
                    }
                }

                outcome
            }
            StmtKind::Import(target) => {
                self.import_module(target, env, statement.span)?;
                Ok(Signal::Normal(Value::Null))
            }
            StmtKind::Block(statements) => self.eval_block(statements, env),
        }
    }

    // ---- expressions ----------------------------------------------------

    pub fn eval_expression(&mut self, expression: &Expression, env: &Env) -> EvalResult {
        let span = expression.span;
        match &expression.kind {
            ExprKind::Integer(v) => Ok(Value::Integer(*v)),
            ExprKind::Float(v) => Ok(Value::Float(*v)),
            ExprKind::Str(s) => Ok(Value::str(s.clone())),
            ExprKind::Boolean(b) => Ok(Value::Boolean(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Identifier(name) => env.get(name).ok_or_else(|| {
                Exception::new(
                    ErrorKind::Name,
                    format!("Undefined variable: {}", name),
                    span,
                )
            }),
            ExprKind::List(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    values.push(self.eval_expression(element, env)?);
                }
                Ok(Value::list(values))
            }
            ExprKind::Prefix(operator, operand) => {
                let value = self.eval_expression(operand, env)?;
                self.eval_prefix(*operator, value, span)
            }
            ExprKind::Infix(operator, left, right) => {
                self.eval_infix(*operator, left, right, env, span)
            }
            ExprKind::Call { callee, arguments } => {
                let callee = self.eval_expression(callee, env)?;
                let mut args = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    args.push(self.eval_expression(argument, env)?);
                }
                self.apply_callable(callee, args, span)
            }
            ExprKind::Index { object, index } => {
                let object = self.eval_expression(object, env)?;
                let index = self.eval_expression(index, env)?;
                self.eval_index(object, index, span)
            }
            ExprKind::Attribute { object, name } => {
                let object = self.eval_expression(object, env)?;
                self.eval_attribute(object, name, span)
            }
            ExprKind::Await(operand) => {
                let value = self.eval_expression(operand, env)?;
                self.await_value(value, span)
            }
        }
    }

    fn eval_prefix(&mut self, operator: PrefixOperator, value: Value, span: Span) -> EvalResult {
        match operator {
            PrefixOperator::Not => Ok(Value::Boolean(!value.is_truthy())),
            PrefixOperator::Minus => match value {
                Value::Integer(v) => v
                    .checked_neg()
                    .map(Value::Integer)
                    .ok_or_else(|| Exception::new(ErrorKind::Runtime, "integer overflow", span)),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => Err(Exception::new(
                    ErrorKind::Type,
                    format!("unsupported operand type for '-': '{}'", other.type_name()),
                    span,
                )),
            },
        }
    }

    fn eval_infix(
        &mut self,
        operator: InfixOperator,
        left: &Expression,
        right: &Expression,
        env: &Env,
        span: Span,
    ) -> EvalResult {
        // `and`/`or` short-circuit and yield the operand that decided.
        match operator {
            InfixOperator::And => {
                let left = self.eval_expression(left, env)?;
                if !left.is_truthy() {
                    return Ok(left);
                }
                return self.eval_expression(right, env);
            }
            InfixOperator::Or => {
                let left = self.eval_expression(left, env)?;
                if left.is_truthy() {
                    return Ok(left);
                }
                return self.eval_expression(right, env);
            }
            _ => {}
        }

        let left = self.eval_expression(left, env)?;
        let right = self.eval_expression(right, env)?;

        match operator {
            InfixOperator::Eq => Ok(Value::Boolean(left == right)),
            InfixOperator::NotEq => Ok(Value::Boolean(left != right)),
            InfixOperator::Is => Ok(Value::Boolean(left.is_identical(&right))),
            InfixOperator::IsNot => Ok(Value::Boolean(!left.is_identical(&right))),
            InfixOperator::In => Ok(Value::Boolean(self.contains(&right, &left, span)?)),
            InfixOperator::NotIn => Ok(Value::Boolean(!self.contains(&right, &left, span)?)),
            InfixOperator::Lt | InfixOperator::Gt | InfixOperator::Le | InfixOperator::Ge => {
                let ordering = compare(&left, &right).ok_or_else(|| {
                    Exception::new(
                        ErrorKind::Type,
                        format!(
                            "'{}' not supported between '{}' and '{}'",
                            operator,
                            left.type_name(),
                            right.type_name()
                        ),
                        span,
                    )
                })?;
                let result = match operator {
                    InfixOperator::Lt => ordering.is_lt(),
                    InfixOperator::Gt => ordering.is_gt(),
                    InfixOperator::Le => ordering.is_le(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Boolean(result))
            }
            InfixOperator::Plus => self.eval_plus(left, right, span),
            InfixOperator::Minus | InfixOperator::Asterisk => {
                self.eval_arithmetic(operator, left, right, span)
            }
            InfixOperator::Slash => self.eval_division(left, right, span),
            InfixOperator::Percent => self.eval_remainder(left, right, span),
            InfixOperator::And | InfixOperator::Or => unreachable!("handled above"),
        }
    }

    fn eval_plus(&mut self, left: Value, right: Value, span: Span) -> EvalResult {
        match (&left, &right) {
            (Value::Integer(a), Value::Integer(b)) => a
                .checked_add(*b)
                .map(Value::Integer)
                .ok_or_else(|| Exception::new(ErrorKind::Runtime, "integer overflow", span)),
            (Value::Integer(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
            (Value::Float(a), Value::Integer(b)) => Ok(Value::Float(a + *b as f64)),
            (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Value::str(s))
            }
            (Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::list(items))
            }
            _ => Err(self.binary_type_error("+", &left, &right, span)),
        }
    }

    fn eval_arithmetic(
        &mut self,
        operator: InfixOperator,
        left: Value,
        right: Value,
        span: Span,
    ) -> EvalResult {
        let symbol = operator.to_string();
        match (&left, &right) {
            (Value::Integer(a), Value::Integer(b)) => {
                let result = match operator {
                    InfixOperator::Minus => a.checked_sub(*b),
                    _ => a.checked_mul(*b),
                };
                result
                    .map(Value::Integer)
                    .ok_or_else(|| Exception::new(ErrorKind::Runtime, "integer overflow", span))
            }
            (Value::Integer(a), Value::Float(b)) => {
                Ok(Value::Float(Self::apply_float(operator, *a as f64, *b)))
            }
            (Value::Float(a), Value::Integer(b)) => {
                Ok(Value::Float(Self::apply_float(operator, *a, *b as f64)))
            }
            (Value::Float(a), Value::Float(b)) => {
                Ok(Value::Float(Self::apply_float(operator, *a, *b)))
            }
            _ => Err(self.binary_type_error(&symbol, &left, &right, span)),
        }
    }

    /// Applies `+`/`-`/`*` to two floats for mixed-type arithmetic.
    fn apply_float(operator: InfixOperator, a: f64, b: f64) -> f64 {
        match operator {
            InfixOperator::Minus => a - b,
            _ => a * b,
        }
    }

    /// `/` always produces a float, including between two integers.
    fn eval_division(&mut self, left: Value, right: Value, span: Span) -> EvalResult {
        let (a, b) = match (&left, &right) {
            (Value::Integer(a), Value::Integer(b)) => (*a as f64, *b as f64),
            (Value::Integer(a), Value::Float(b)) => (*a as f64, *b),
            (Value::Float(a), Value::Integer(b)) => (*a, *b as f64),
            (Value::Float(a), Value::Float(b)) => (*a, *b),
            _ => return Err(self.binary_type_error("/", &left, &right, span)),
        };
        if b == 0.0 {
            return Err(Exception::new(ErrorKind::Runtime, "division by zero", span));
        }
        Ok(Value::Float(a / b))
    }

    /// Remainder keeps the sign of the dividend.
    fn eval_remainder(&mut self, left: Value, right: Value, span: Span) -> EvalResult {
        match (&left, &right) {
            (Value::Integer(a), Value::Integer(b)) => {
                if *b == 0 {
                    return Err(Exception::new(ErrorKind::Runtime, "modulo by zero", span));
                }
                a.checked_rem(*b)
                    .map(Value::Integer)
                    .ok_or_else(|| Exception::new(ErrorKind::Runtime, "integer overflow", span))
            }
            (Value::Integer(a), Value::Float(b)) => self.float_remainder(*a as f64, *b, span),
            (Value::Float(a), Value::Integer(b)) => self.float_remainder(*a, *b as f64, span),
            (Value::Float(a), Value::Float(b)) => self.float_remainder(*a, *b, span),
            _ => Err(self.binary_type_error("%", &left, &right, span)),
        }
    }

    fn float_remainder(&self, a: f64, b: f64, span: Span) -> EvalResult {
        if b == 0.0 {
            return Err(Exception::new(ErrorKind::Runtime, "modulo by zero", span));
        }
        Ok(Value::Float(a % b))
    }

    fn binary_type_error(
        &self,
        symbol: &str,
        left: &Value,
        right: &Value,
        span: Span,
    ) -> Exception {
        Exception::new(
            ErrorKind::Type,
            format!(
                "unsupported operand types for '{}': '{}' and '{}'",
                symbol,
                left.type_name(),
                right.type_name()
            ),
            span,
        )
    }

    /// `in`: list/tuple/set membership by equality, substring for strings,
    /// key membership for dicts.
    fn contains(&mut self, container: &Value, item: &Value, span: Span) -> Result<bool, Exception> {
        match container {
            Value::List(items) => Ok(items.borrow().iter().any(|v| v == item)),
            Value::Tuple(items) => Ok(items.iter().any(|v| v == item)),
            Value::Set(entries) => {
                let key = Key::from_value(item, span)?;
                Ok(entries.borrow().contains(&key))
            }
            Value::Dict(entries) => {
                let key = Key::from_value(item, span)?;
                Ok(entries.borrow().contains_key(&key))
            }
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
                other => Err(Exception::new(
                    ErrorKind::Type,
                    format!("'in <str>' requires a string, not '{}'", other.type_name()),
                    span,
                )),
            },
            other => Err(Exception::new(
                ErrorKind::Type,
                format!("'{}' is not iterable", other.type_name()),
                span,
            )),
        }
    }

    fn eval_index(&mut self, object: Value, index: Value, span: Span) -> EvalResult {
        match (&object, &index) {
            (Value::List(items), Value::Integer(i)) => {
                let items = items.borrow();
                lookup_sequence(&items, *i)
                    .cloned()
                    .ok_or_else(|| {
                        Exception::new(ErrorKind::Runtime, "list index out of range", span)
                    })
            }
            (Value::Tuple(items), Value::Integer(i)) => lookup_sequence(items, *i)
                .cloned()
                .ok_or_else(|| {
                    Exception::new(ErrorKind::Runtime, "tuple index out of range", span)
                }),
            (Value::Str(s), Value::Integer(i)) => {
                let chars: Vec<char> = s.chars().collect();
                lookup_sequence(&chars, *i)
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(|| {
                        Exception::new(ErrorKind::Runtime, "string index out of range", span)
                    })
            }
            (Value::Dict(entries), _) => {
                let key = Key::from_value(&index, span)?;
                entries.borrow().get(&key).cloned().ok_or_else(|| {
                    Exception::new(
                        ErrorKind::Runtime,
                        format!("key not found: {}", index),
                        span,
                    )
                })
            }
            (Value::List(_) | Value::Tuple(_) | Value::Str(_), other) => Err(Exception::new(
                ErrorKind::Type,
                format!("indices must be integers, not '{}'", other.type_name()),
                span,
            )),
            (other, _) => Err(Exception::new(
                ErrorKind::Type,
                format!("'{}' is not subscriptable", other.type_name()),
                span,
            )),
        }
    }

    /// Attribute access is dict string-key sugar; nothing else carries
    /// attributes.
    fn eval_attribute(&mut self, object: Value, name: &str, span: Span) -> EvalResult {
        match &object {
            Value::Dict(entries) => {
                let key = Key::Str(Rc::from(name));
                entries.borrow().get(&key).cloned().ok_or_else(|| {
                    Exception::new(
                        ErrorKind::Runtime,
                        format!("dict has no key '{}'", name),
                        span,
                    )
                })
            }
            other => Err(Exception::new(
                ErrorKind::Type,
                format!("'{}' has no attribute '{}'", other.type_name(), name),
                span,
            )),
        }
    }

    // ---- calls and tasks ------------------------------------------------

    pub fn apply_callable(
        &mut self,
        callee: Value,
        arguments: Vec<Value>,
        span: Span,
    ) -> EvalResult {
        match callee {
            Value::Function(function) => {
                if arguments.len() != function.parameters.len() {
                    return Err(Exception::new(
                        ErrorKind::Argument,
                        format!(
                            "{}() takes {} argument{} but {} {} given",
                            function.name,
                            function.parameters.len(),
                            if function.parameters.len() == 1 { "" } else { "s" },
                            arguments.len(),
                            if arguments.len() == 1 { "was" } else { "were" }
                        ),
                        span,
                    ));
                }
                if function.is_async {
                    // Async calls never run the body now: they queue a task
                    // and hand back its handle.
                    let task = self.scheduler.spawn(TaskKind::Call {
                        function,
                        arguments,
                        span,
                    });
                    return Ok(Value::Task(task));
                }
                self.call_function(&function, arguments, span)
            }
            Value::BuiltIn(builtin) => {
                builtins::check_arity(builtin, arguments.len(), span)?;
                (builtin.func)(self, arguments, span)
            }
            other => Err(Exception::new(
                ErrorKind::Type,
                format!("'{}' is not callable", other.type_name()),
                span,
            )),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        arguments: Vec<Value>,
        call_span: Span,
    ) -> EvalResult {
        let frame = Env::extend(&function.env);
        for (parameter, argument) in function.parameters.iter().zip(arguments) {
            frame.set_local(parameter, argument);
        }

        let signal = self
            .eval_block(&function.body, &frame)
            .map_err(|mut error| {
                error.push_trace(call_span);
                error
            })?;

        let result = match signal {
            Signal::Return(value) => value,
            Signal::Normal(_) => Value::Null,
        };
        Ok(retag_custom_error(function, result))
    }

    /// `await`: non-tasks pass through; otherwise drive the scheduler until
    /// the task has its one outcome and hand it over.
    pub fn await_value(&mut self, value: Value, span: Span) -> EvalResult {
        let task = match value {
            Value::Task(task) => task,
            other => return Ok(other),
        };

        let deadline = {
            let state = task.borrow();
            match &state.state {
                TaskState::Completed(_) | TaskState::Failed(_) => None,
                TaskState::Running => {
                    return Err(Exception::new(
                        ErrorKind::Runtime,
                        "task deadlock: task is awaiting itself",
                        span,
                    ))
                }
                TaskState::Pending => match &state.kind {
                    TaskKind::Timer { deadline } => Some(*deadline),
                    _ => None,
                },
            }
        };

        if let Some(deadline) = deadline {
            self.wait_for_timer(&task, deadline);
        } else if matches!(task.borrow().state, TaskState::Pending) {
            self.drive(&task);
        }

        let mut state = task.borrow_mut();
        state.observed = true;
        match &state.state {
            TaskState::Completed(value) => Ok(value.clone()),
            TaskState::Failed(error) => Err(error.clone()),
            _ => Err(Exception::new(
                ErrorKind::Runtime,
                "task never completed",
                span,
            )),
        }
    }

    /// Runs ready tasks in FIFO order until the awaited one has finished.
    fn drive(&mut self, awaited: &TaskRef) {
        while let Some(task) = self.scheduler.pop_ready() {
            self.run_task(&task);
            if Rc::ptr_eq(&task, awaited) {
                return;
            }
        }
    }

    /// Awaiting a timer pumps other ready tasks; once the queue is empty the
    /// remaining delay is slept out.
    fn wait_for_timer(&mut self, task: &TaskRef, deadline: Instant) {
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.scheduler.pop_ready() {
                Some(ready) => self.run_task(&ready),
                None => thread::sleep(deadline - now),
            }
        }
        task.borrow_mut().state = TaskState::Completed(Value::Null);
    }

    /// Executes one task body to completion and caches its outcome.
    fn run_task(&mut self, task: &TaskRef) {
        enum Work {
            Call(Rc<Function>, Vec<Value>, Span),
            Script(PathBuf, Span),
        }

        let work = {
            let mut state = task.borrow_mut();
            if !matches!(state.state, TaskState::Pending) {
                return;
            }
            state.state = TaskState::Running;
            match &mut state.kind {
                TaskKind::Call {
                    function,
                    arguments,
                    span,
                } => Work::Call(Rc::clone(function), mem::take(arguments), *span),
                TaskKind::Script { path, span } => Work::Script(path.clone(), *span),
                TaskKind::Timer { deadline } => {
                    let deadline = *deadline;
                    drop(state);
                    self.wait_for_timer(task, deadline);
                    return;
                }
            }
        };

        let outcome = match work {
            Work::Call(function, arguments, span) => {
                self.call_function(&function, arguments, span)
            }
            Work::Script(path, span) => self.eval_script_task(&path, span),
        };

        task.borrow_mut().state = match outcome {
            Ok(value) => TaskState::Completed(value),
            Err(error) => TaskState::Failed(error),
        };
    }
}

/// The documented custom-exception idiom: a user function that returns an
/// error value still tagged `Error` stamps it with its own name, so
/// `except TheFunction` matches while `except Error` still catches all.
fn retag_custom_error(function: &Rc<Function>, value: Value) -> Value {
    if let Value::Error(error) = &value {
        if error.kind == ErrorKind::Error {
            let mut retagged = (**error).clone();
            retagged.kind = ErrorKind::Custom(function.name.clone());
            return Value::Error(Rc::new(retagged));
        }
    }
    value
}

fn lookup_sequence<T>(items: &[T], index: i64) -> Option<&T> {
    let len = items.len() as i64;
    let i = if index < 0 { index + len } else { index };
    if (0..len).contains(&i) {
        items.get(i as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_input(input: &str) -> EvalResult {
        let mut interp = Interpreter::new();
        interp.eval_source(input, "<test>")
    }

    fn expect_values(tests: Vec<(&str, &str)>) {
        for (input, expected) in &tests {
            match eval_input(input) {
                Ok(value) => {
                    assert_eq!(expected.to_string(), value.to_string(), "for `{}`", input);
                }
                Err(err) => {
                    panic!(
                        "expected `{}`, but got error `{}` for `{}`",
                        expected, err.message, input
                    );
                }
            }
        }
    }

    fn expect_errors(tests: Vec<(&str, ErrorKind, &str)>) {
        for (input, kind, message) in &tests {
            match eval_input(input) {
                Ok(value) => panic!("no error raised, got `{}` for `{}`", value, input),
                Err(err) => {
                    assert_eq!(kind, &err.kind, "for `{}`", input);
                    assert_eq!(message, &err.message, "for `{}`", input);
                }
            }
        }
    }

    #[test]
    fn integer_arithmetic() {
        expect_values(vec![
            ("5", "5"),
            ("-5", "-5"),
            ("5 + 5 + 5 + 5 - 10", "10"),
            ("2 * 2 * 2 * 2 * 2", "32"),
            ("-50 + 100 + -50", "0"),
            ("5 * 2 + 10", "20"),
            ("5 + 2 * 10", "25"),
            ("(5 + 10 * 2 + 15 / 3) * 2 + -10", "50.0"),
            ("7 % 3", "1"),
            ("-7 % 3", "-1"),
            ("7 % -3", "1"),
        ]);
    }

    #[test]
    fn division_always_yields_float() {
        expect_values(vec![
            ("6 / 2", "3.0"),
            ("7 / 2", "3.5"),
            ("6.0 / 2", "3.0"),
            ("1 / 3 * 3", "1.0"),
        ]);
    }

    #[test]
    fn float_arithmetic() {
        expect_values(vec![
            ("3.1415", "3.1415"),
            ("0.1 + 0.2 > 0.3 - 0.1", "true"),
            ("2.5 * 4", "10.0"),
            ("1 + 2.5", "3.5"),
            ("7.5 % 2", "1.5"),
        ]);
    }

    #[test]
    fn string_operations() {
        expect_values(vec![
            (r#""Hello" + " " + "World!""#, "Hello World!"),
            (r#""abc" < "abd""#, "true"),
            (r#""ell" in "Hello""#, "true"),
            (r#""z" not in "Hello""#, "true"),
            (r#"'single' + "double""#, "singledouble"),
        ]);
    }

    #[test]
    fn comparison_and_logic() {
        expect_values(vec![
            ("1 < 2", "true"),
            ("1 > 2", "false"),
            ("1 <= 1", "true"),
            ("2 >= 3", "false"),
            ("1 == 1.0", "true"),
            ("1 != 2", "true"),
            ("true and false", "false"),
            ("true or false", "true"),
            ("not true", "false"),
            ("not 0", "true"),
            ("null is null", "true"),
            ("5 is not 3", "true"),
            ("1 in [1, 2, 3]", "true"),
            ("4 not in [1, 2, 3]", "true"),
        ]);
    }

    #[test]
    fn short_circuit_yields_the_deciding_operand() {
        expect_values(vec![
            ("false and boom()", "false"),
            ("0 and boom()", "0"),
            ("true or boom()", "true"),
            ("1 or boom()", "1"),
            ("null or \"fallback\"", "fallback"),
            ("[] or [1]", "[1]"),
        ]);
    }

    #[test]
    fn truthiness_of_containers() {
        expect_values(vec![
            ("not []", "true"),
            ("not [0]", "false"),
            ("not \"\"", "true"),
            ("not dict()", "true"),
            ("not set()", "true"),
            ("not tuple()", "true"),
            ("not 0.0", "true"),
        ]);
    }

    #[test]
    fn variables_and_assignment() {
        expect_values(vec![
            ("x = 5\nx", "5"),
            ("var x = 5\nx", "5"),
            ("x = 5\nx = x + 1\nx", "6"),
            ("a = 5\nb = a\nc = a + b + 5\nc", "15"),
        ]);
    }

    #[test]
    fn if_elif_else() {
        expect_values(vec![
            ("if (true) { 10 }", "10"),
            ("if (false) { 10 }", "null"),
            ("if (1 < 2) { 10 } else { 20 }", "10"),
            ("if (1 > 2) { 10 } else { 20 }", "20"),
            ("x = 3\nif (x == 1) { \"a\" } elif (x == 3) { \"b\" } else { \"c\" }", "b"),
        ]);
    }

    #[test]
    fn while_loops() {
        expect_values(vec![(
            "i = 0\ntotal = 0\nwhile (i < 5) { total = total + i; i = i + 1 }\ntotal",
            "10",
        )]);
    }

    #[test]
    fn for_loops() {
        expect_values(vec![
            ("total = 0\nfor (x in [1, 2, 3]) { total = total + x }\ntotal", "6"),
            ("total = 0\nfor (x in range(1, 4)) { total = total + x }\ntotal", "6"),
            ("s = \"\"\nfor (c in \"abc\") { s = c + s }\ns", "cba"),
            // Dicts iterate their keys in insertion order.
            (
                "d = dict_set(dict_set(dict(), \"b\", 1), \"a\", 2)\nks = \"\"\nfor (k in d) { ks = ks + k }\nks",
                "ba",
            ),
            // The loop variable lands in the enclosing scope.
            ("for (x in [1, 2, 3]) { }\nx", "3"),
        ]);
    }

    #[test]
    fn functions_and_calls() {
        expect_values(vec![
            ("def add(a, b) { return a + b }\nadd(2, 3)", "5"),
            ("def ten() { return 10 }\nten()", "10"),
            ("def noop() { }\nnoop()", "null"),
            ("def early() { return 1; 2 }\nearly()", "1"),
            (
                "def fib(n) { if (n < 2) { return n }\nreturn fib(n - 1) + fib(n - 2) }\nfib(10)",
                "55",
            ),
        ]);
    }

    #[test]
    fn closures_capture_their_defining_frame() {
        expect_values(vec![
            (
                "def make_adder(x) { def add(y) { return x + y }\nreturn add }\nadd_two = make_adder(2)\nadd_two(2)",
                "4",
            ),
            (
                "def counter() { n = 0\ndef tick() { n = n + 1\nreturn n }\nreturn tick }\nc = counter()\nc()\nc()\nc()",
                "3",
            ),
        ]);
    }

    #[test]
    fn assignment_in_functions_shadows_globals() {
        expect_values(vec![
            ("x = 1\ndef f() { x = 2\nreturn x }\nf()\nx", "1"),
            ("x = 1\ndef f() { return x }\nf()", "1"),
        ]);
    }

    #[test]
    fn lists_are_shared_through_aliases() {
        expect_values(vec![
            ("a = [1, 2]\nb = a\nappend(b, 3)\na", "[1, 2, 3]"),
            ("a = [1]\nb = a\na is b", "true"),
            ("[1, 2] is [1, 2]", "false"),
            ("[1, 2] == [1, 2]", "true"),
            ("a = [1] + [2]\na", "[1, 2]"),
        ]);
    }

    #[test]
    fn indexing() {
        expect_values(vec![
            ("[1, 2, 3][0]", "1"),
            ("[1, 2, 3][-1]", "3"),
            ("\"hello\"[1]", "e"),
            ("\"hello\"[-1]", "o"),
            ("d = dict_set(dict(), \"k\", 7)\nd[\"k\"]", "7"),
            ("d = dict_set(dict(), \"k\", 7)\nd.k", "7"),
            ("t = tuple(1, 2)\nt[1]", "2"),
        ]);
    }

    #[test]
    fn error_cases() {
        expect_errors(vec![
            ("boom", ErrorKind::Name, "Undefined variable: boom"),
            (
                "5 + \"a\"",
                ErrorKind::Type,
                "unsupported operand types for '+': 'int' and 'str'",
            ),
            (
                "-true",
                ErrorKind::Type,
                "unsupported operand type for '-': 'bool'",
            ),
            ("1 / 0", ErrorKind::Runtime, "division by zero"),
            ("1.0 / 0", ErrorKind::Runtime, "division by zero"),
            ("1 % 0", ErrorKind::Runtime, "modulo by zero"),
            ("[1, 2][5]", ErrorKind::Runtime, "list index out of range"),
            ("d = dict()\nd[\"missing\"]", ErrorKind::Runtime, "key not found: missing"),
            ("x = 5\nx()", ErrorKind::Type, "'int' is not callable"),
            (
                "def f(a) { }\nf(1, 2)",
                ErrorKind::Argument,
                "f() takes 1 argument but 2 were given",
            ),
            (
                "def f(a, b) { }\nf(1)",
                ErrorKind::Argument,
                "f() takes 2 arguments but 1 was given",
            ),
            ("raise 5", ErrorKind::Type, "exceptions must be error values, not 'int'"),
            (
                "1 < \"a\"",
                ErrorKind::Type,
                "'<' not supported between 'int' and 'str'",
            ),
            ("5 in 5", ErrorKind::Type, "'int' is not iterable"),
            ("for (x in 5) { }", ErrorKind::Type, "'int' is not iterable"),
            (
                "len(1)",
                ErrorKind::Argument,
                "argument to 'len' not supported, got int",
            ),
            (
                "len(\"a\", \"b\")",
                ErrorKind::Argument,
                "len() takes 1 argument but 2 were given",
            ),
        ]);
    }

    #[test]
    fn integer_overflow_is_a_runtime_error() {
        let err = eval_input("9223372036854775807 + 1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);
        assert_eq!(err.message, "integer overflow");
    }

    #[test]
    fn raise_and_catch() {
        expect_values(vec![
            (
                "try { raise Error(\"boom\") } except Error as e { \"caught\" }",
                "caught",
            ),
            (
                "try { raise Error(\"boom\") } except Error as e { str(e) }",
                "boom",
            ),
            (
                "x = 0\ntry { raise Error(\"b\") } except Error { x = 1 } finally { x = x + 10 }\nx",
                "11",
            ),
            // finally runs on the normal path too
            ("x = 0\ntry { x = 1 } except Error { x = 2 } finally { x = x + 10 }\nx", "11"),
            // runtime errors are catchable by kind
            (
                "try { 1 / 0 } except RuntimeError as e { \"div\" }",
                "div",
            ),
            (
                "try { missing } except NameError { \"name\" }",
                "name",
            ),
            // Error is the universal super-tag
            ("try { 1 / 0 } except Error { \"any\" }", "any"),
            // first matching clause wins
            (
                "try { 1 / 0 } except TypeError { \"t\" } except RuntimeError { \"r\" } except Error { \"e\" }",
                "r",
            ),
        ]);
    }

    #[test]
    fn uncaught_kinds_propagate() {
        let err = eval_input("try { 1 / 0 } except TypeError { \"nope\" }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Runtime);

        let err = eval_input("try { raise Error(\"x\") } except NameError { 1 }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Error);
    }

    #[test]
    fn finally_replaces_pending_signals_when_it_raises_or_returns() {
        // finally raising replaces the original error
        let err = eval_input(
            "try { 1 / 0 } except TypeError { } finally { raise Error(\"replaced\") }",
        )
        .unwrap_err();
        assert_eq!(err.message, "replaced");

        // finally returning replaces the handler's return
        expect_values(vec![(
            "def f() { try { return 1 } except Error { } finally { return 2 } }\nf()",
            "2",
        )]);
    }

    #[test]
    fn finally_runs_on_return_paths() {
        expect_values(vec![(
            "log = []\ndef f() { try { return 1 } except Error { } finally { append(log, 99) } }\nr = f()\nstr(r) + \" \" + str(log[0])",
            "1 99",
        )]);
    }

    #[test]
    fn custom_exceptions_match_by_function_name() {
        expect_values(vec![
            (
                "def ValidationError(msg) { return Error(msg) }\ntry { raise ValidationError(\"bad\") } except ValidationError as e { str(e) }",
                "bad",
            ),
            (
                "def ValidationError(msg) { return Error(msg) }\ntry { raise ValidationError(\"bad\") } except Error { \"generic\" }",
                "generic",
            ),
        ]);

        let err = eval_input(
            "def A(m) { return Error(m) }\ndef B(m) { return Error(m) }\ntry { raise A(\"x\") } except B { 1 }",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Custom("A".to_string()));
    }

    #[test]
    fn call_sites_are_appended_to_the_trace() {
        let err = eval_input("def inner() { return missing }\ndef outer() { return inner() }\nouter()")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Name);
        assert_eq!(err.trace.len(), 2);
    }

    #[test]
    fn async_calls_return_task_handles_immediately() {
        expect_values(vec![
            ("async def f() { return 42 }\ntype(f())", "task"),
            ("async def f() { return 42 }\nt = f()\nawait t", "42"),
            ("async def f() { return 42 }\nawait f()", "42"),
            // body must not have run before the await
            (
                "x = 0\nasync def f() { x = 99\nreturn x }\nt = f()\nbefore = x\nr = await t\nstr(before) + \" \" + str(r)",
                "0 99",
            ),
        ]);
    }

    #[test]
    fn await_passes_non_tasks_through() {
        expect_values(vec![("await 5", "5"), ("await \"x\"", "x")]);
    }

    #[test]
    fn awaiting_twice_returns_the_cached_outcome() {
        expect_values(vec![(
            "n = 0\nasync def f() { n = n + 1\nreturn n }\nt = f()\na = await t\nb = await t\nstr(a) + \" \" + str(b)",
            "1 1",
        )]);

        // failures are cached too
        let err = eval_input(
            "async def f() { raise Error(\"once\") }\nt = f()\ntry { await t } except Error { }\nawait t",
        )
        .unwrap_err();
        assert_eq!(err.message, "once");
    }

    #[test]
    fn tasks_run_in_spawn_order() {
        expect_values(vec![(
            "log = []\nasync def a() { append(log, 1) }\nasync def b() { append(log, 2) }\nta = a()\ntb = b()\nawait tb\nlog",
            "[1, 2]",
        )]);
    }

    #[test]
    fn sleep_yields_a_timer_task() {
        expect_values(vec![
            ("type(sleep(0))", "task"),
            ("await sleep(0)", "null"),
            ("async def f() { await sleep(0)\nreturn 42 }\nt = f()\nawait t", "42"),
        ]);
    }

    #[test]
    fn failed_task_raises_at_the_await_site() {
        expect_values(vec![(
            "async def f() { raise Error(\"inner\") }\ntry { await f() } except Error as e { str(e) }",
            "inner",
        )]);
    }

    #[test]
    fn unawaited_failures_surface_at_finish() {
        let mut interp = Interpreter::new();
        interp
            .eval_source("async def f() { raise Error(\"lost\") }\nt = f()", "<test>")
            .unwrap();
        let failures = interp.finish();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "lost");
    }

    #[test]
    fn awaited_failures_are_not_reported_again_at_finish() {
        let mut interp = Interpreter::new();
        interp
            .eval_source(
                "async def f() { raise Error(\"seen\") }\nt = f()\ntry { await t } except Error { }",
                "<test>",
            )
            .unwrap();
        assert!(interp.finish().is_empty());
    }

    #[test]
    fn builtins_are_shadowable() {
        expect_values(vec![("len = 5\nlen", "5")]);
    }

    #[test]
    fn builtin_sampler() {
        expect_values(vec![
            ("len(\"four\")", "4"),
            ("len([1, 2, 3])", "3"),
            ("str(42)", "42"),
            ("int(\"42\")", "42"),
            ("int(3.9)", "3"),
            ("float(3)", "3.0"),
            ("type(3.5)", "float"),
            ("type(null)", "null"),
            ("range(3)", "[0, 1, 2]"),
            ("range(1, 4)", "[1, 2, 3]"),
            ("range(10, 0, -3)", "[10, 7, 4, 1]"),
            ("sum([1, 2, 3])", "6"),
            ("min([3, 1, 2])", "1"),
            ("max([3, 1, 2])", "3"),
            ("abs(-3)", "3"),
            ("sorted([3, 1, 2])", "[1, 2, 3]"),
            ("reverse([1, 2, 3])", "[3, 2, 1]"),
            ("pop([1, 2, 3])", "3"),
            ("slice([1, 2, 3, 4], 1, 3)", "[2, 3]"),
            ("slice(\"hello\", 1, -1)", "ell"),
            ("join([1, 2, 3], \"-\")", "1-2-3"),
            ("split(\"a,b,c\", \",\")", "['a', 'b', 'c']"),
            ("strip(\"  x  \")", "x"),
            ("upper(\"abc\")", "ABC"),
            ("lower(\"ABC\")", "abc"),
            ("replace(\"aaa\", \"a\", \"b\")", "bbb"),
            ("find(\"hello\", \"ll\")", "2"),
            ("find(\"hello\", \"zz\")", "-1"),
            ("startswith(\"hello\", \"he\")", "true"),
            ("endswith(\"hello\", \"lo\")", "true"),
            ("dict_get(dict(), \"k\", 9)", "9"),
            ("dict_keys(dict_set(dict(), \"a\", 1))", "['a']"),
            ("dict_values(dict_set(dict(), \"a\", 1))", "[1]"),
            ("2 in set(1, 2, 3)", "true"),
            ("tuple(1, 2)", "(1, 2)"),
            ("sqrt(9)", "3.0"),
            ("pow(2, 10)", "1024.0"),
            ("floor(3.7)", "3"),
            ("ceil(3.2)", "4"),
            ("type(Error(\"m\"))", "error"),
        ]);
    }

    #[test]
    fn repeated_pure_evaluation_is_stable() {
        let mut interp = Interpreter::new();
        interp
            .eval_source("xs = [3, 1, 2]\ndef f(a) { return sorted(a)[0] + len(a) }", "<test>")
            .unwrap();
        let a = interp.eval_source("f(xs)", "<again>").unwrap();
        let b = interp.eval_source("f(xs)", "<again>").unwrap();
        assert_eq!(a, b);
    }
}
