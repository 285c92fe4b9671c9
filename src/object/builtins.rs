use std::cell::RefCell;
use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::{Read as _, Write as _};
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use indexmap::{IndexMap, IndexSet};

use crate::error::{ErrorKind, Exception};
use crate::evaluator::Interpreter;
use crate::object::{compare, Env, EvalResult, FileHandle, Key, Value};
use crate::token::Span;

/// A host callable. Arity bounds are checked by the evaluator before the
/// body runs; bodies may still raise for bad argument types.
pub type HostFn = fn(&mut Interpreter, Vec<Value>, Span) -> EvalResult;

pub struct BuiltIn {
    pub name: &'static str,
    pub min_arity: usize,
    /// `None` means variadic.
    pub max_arity: Option<usize>,
    pub func: HostFn,
}

impl std::fmt::Debug for BuiltIn {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BuiltIn").field("name", &self.name).finish()
    }
}

/// The registry: every entry is preloaded into the global frame, where user
/// assignments may shadow it.
pub static BUILTINS: &[BuiltIn] = &[
    BuiltIn { name: "print", min_arity: 0, max_arity: None, func: print },
    BuiltIn { name: "input", min_arity: 0, max_arity: Some(1), func: input },
    BuiltIn { name: "len", min_arity: 1, max_arity: Some(1), func: len },
    BuiltIn { name: "str", min_arity: 1, max_arity: Some(1), func: to_str },
    BuiltIn { name: "int", min_arity: 1, max_arity: Some(1), func: to_int },
    BuiltIn { name: "float", min_arity: 1, max_arity: Some(1), func: to_float },
    BuiltIn { name: "type", min_arity: 1, max_arity: Some(1), func: type_of },
    BuiltIn { name: "range", min_arity: 1, max_arity: Some(3), func: range },
    BuiltIn { name: "sum", min_arity: 1, max_arity: Some(1), func: sum },
    BuiltIn { name: "min", min_arity: 1, max_arity: Some(1), func: min },
    BuiltIn { name: "max", min_arity: 1, max_arity: Some(1), func: max },
    BuiltIn { name: "abs", min_arity: 1, max_arity: Some(1), func: abs },
    BuiltIn { name: "sorted", min_arity: 1, max_arity: Some(1), func: sorted },
    BuiltIn { name: "reverse", min_arity: 1, max_arity: Some(1), func: reverse },
    BuiltIn { name: "append", min_arity: 2, max_arity: Some(2), func: append },
    BuiltIn { name: "pop", min_arity: 1, max_arity: Some(1), func: pop },
    BuiltIn { name: "slice", min_arity: 2, max_arity: Some(3), func: slice },
    BuiltIn { name: "join", min_arity: 1, max_arity: Some(2), func: join },
    BuiltIn { name: "split", min_arity: 1, max_arity: Some(2), func: split },
    BuiltIn { name: "strip", min_arity: 1, max_arity: Some(1), func: strip },
    BuiltIn { name: "upper", min_arity: 1, max_arity: Some(1), func: upper },
    BuiltIn { name: "lower", min_arity: 1, max_arity: Some(1), func: lower },
    BuiltIn { name: "replace", min_arity: 3, max_arity: Some(3), func: replace },
    BuiltIn { name: "find", min_arity: 2, max_arity: Some(2), func: find },
    BuiltIn { name: "startswith", min_arity: 2, max_arity: Some(2), func: startswith },
    BuiltIn { name: "endswith", min_arity: 2, max_arity: Some(2), func: endswith },
    BuiltIn { name: "dict", min_arity: 0, max_arity: Some(0), func: dict },
    BuiltIn { name: "dict_get", min_arity: 2, max_arity: Some(3), func: dict_get },
    BuiltIn { name: "dict_set", min_arity: 3, max_arity: Some(3), func: dict_set },
    BuiltIn { name: "dict_keys", min_arity: 1, max_arity: Some(1), func: dict_keys },
    BuiltIn { name: "dict_values", min_arity: 1, max_arity: Some(1), func: dict_values },
    BuiltIn { name: "set", min_arity: 0, max_arity: None, func: set },
    BuiltIn { name: "tuple", min_arity: 0, max_arity: None, func: tuple },
    BuiltIn { name: "sqrt", min_arity: 1, max_arity: Some(1), func: sqrt },
    BuiltIn { name: "pow", min_arity: 2, max_arity: Some(2), func: pow },
    BuiltIn { name: "floor", min_arity: 1, max_arity: Some(1), func: floor },
    BuiltIn { name: "ceil", min_arity: 1, max_arity: Some(1), func: ceil },
    BuiltIn { name: "Error", min_arity: 1, max_arity: Some(1), func: error_value },
    BuiltIn { name: "sleep", min_arity: 1, max_arity: Some(1), func: sleep },
    BuiltIn { name: "time", min_arity: 0, max_arity: Some(0), func: time },
    BuiltIn { name: "open", min_arity: 1, max_arity: Some(2), func: open },
    BuiltIn { name: "read", min_arity: 1, max_arity: Some(1), func: read },
    BuiltIn { name: "write", min_arity: 2, max_arity: Some(2), func: write },
    BuiltIn { name: "close", min_arity: 1, max_arity: Some(1), func: close },
    BuiltIn { name: "run", min_arity: 1, max_arity: Some(1), func: run },
    BuiltIn { name: "run_async", min_arity: 1, max_arity: Some(1), func: run_async },
    BuiltIn { name: "exit", min_arity: 0, max_arity: Some(1), func: exit },
];

/// Preloads the registry into a global frame.
pub fn install(env: &Env) {
    for builtin in BUILTINS {
        env.set_local(builtin.name, Value::BuiltIn(builtin));
    }
}

/// Raises `ArgumentError` unless `given` is within the builtin's declared
/// arity bounds.
pub fn check_arity(builtin: &BuiltIn, given: usize, span: Span) -> Result<(), Exception> {
    let ok = given >= builtin.min_arity
        && builtin.max_arity.map_or(true, |max| given <= max);
    if ok {
        return Ok(());
    }

    let expected = match (builtin.min_arity, builtin.max_arity) {
        (min, Some(max)) if min == max => format!("{} argument{}", min, plural(min)),
        (min, Some(max)) => format!("{} to {} arguments", min, max),
        (min, None) => format!("at least {} argument{}", min, plural(min)),
    };
    Err(Exception::new(
        ErrorKind::Argument,
        format!(
            "{}() takes {} but {} {} given",
            builtin.name,
            expected,
            given,
            if given == 1 { "was" } else { "were" }
        ),
        span,
    ))
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn unsupported(name: &str, value: &Value, span: Span) -> Exception {
    Exception::new(
        ErrorKind::Argument,
        format!("argument to '{}' not supported, got {}", name, value.type_name()),
        span,
    )
}

fn want_str(name: &str, value: &Value, span: Span) -> Result<Rc<str>, Exception> {
    match value {
        Value::Str(s) => Ok(Rc::clone(s)),
        other => Err(unsupported(name, other, span)),
    }
}

fn want_int(name: &str, value: &Value, span: Span) -> Result<i64, Exception> {
    match value {
        Value::Integer(v) => Ok(*v),
        other => Err(unsupported(name, other, span)),
    }
}

fn want_number(name: &str, value: &Value, span: Span) -> Result<f64, Exception> {
    match value {
        Value::Integer(v) => Ok(*v as f64),
        Value::Float(v) => Ok(*v),
        other => Err(unsupported(name, other, span)),
    }
}

fn want_list(
    name: &str,
    value: &Value,
    span: Span,
) -> Result<Rc<RefCell<Vec<Value>>>, Exception> {
    match value {
        Value::List(l) => Ok(Rc::clone(l)),
        other => Err(unsupported(name, other, span)),
    }
}

fn want_dict(
    name: &str,
    value: &Value,
    span: Span,
) -> Result<Rc<RefCell<IndexMap<Key, Value>>>, Exception> {
    match value {
        Value::Dict(d) => Ok(Rc::clone(d)),
        other => Err(unsupported(name, other, span)),
    }
}

fn want_file(
    name: &str,
    value: &Value,
    span: Span,
) -> Result<Rc<RefCell<FileHandle>>, Exception> {
    match value {
        Value::File(f) => Ok(Rc::clone(f)),
        other => Err(unsupported(name, other, span)),
    }
}

/// The elements of any iterable value, in iteration order (dicts iterate
/// their keys, strings their characters).
pub fn iter_elements(value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(l) => Some(l.borrow().clone()),
        Value::Tuple(t) => Some(t.as_ref().clone()),
        Value::Set(s) => Some(s.borrow().iter().map(Key::to_value).collect()),
        Value::Dict(d) => Some(d.borrow().keys().map(Key::to_value).collect()),
        Value::Str(s) => Some(s.chars().map(|c| Value::str(c.to_string())).collect()),
        _ => None,
    }
}

// ---- the bodies ---------------------------------------------------------

fn print(interp: &mut Interpreter, args: Vec<Value>, _span: Span) -> EvalResult {
    let line = args
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    interp.write_line(&line);
    Ok(Value::Null)
}

fn input(interp: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    if let Some(prompt) = args.first() {
        interp.write_str(&want_str("input", prompt, span)?);
    }
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| Exception::new(ErrorKind::Runtime, format!("input failed: {}", e), span))?;
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Value::str(line))
}

fn len(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(l) => l.borrow().len(),
        Value::Dict(d) => d.borrow().len(),
        Value::Set(s) => s.borrow().len(),
        Value::Tuple(t) => t.len(),
        other => return Err(unsupported("len", other, span)),
    };
    Ok(Value::Integer(n as i64))
}

fn to_str(_: &mut Interpreter, args: Vec<Value>, _span: Span) -> EvalResult {
    Ok(Value::str(args[0].to_string()))
}

fn to_int(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    match &args[0] {
        Value::Integer(v) => Ok(Value::Integer(*v)),
        Value::Float(v) => Ok(Value::Integer(*v as i64)),
        Value::Boolean(b) => Ok(Value::Integer(*b as i64)),
        Value::Str(s) => s.trim().parse().map(Value::Integer).map_err(|_| {
            Exception::new(
                ErrorKind::Argument,
                format!("invalid literal for int(): '{}'", s),
                span,
            )
        }),
        other => Err(unsupported("int", other, span)),
    }
}

fn to_float(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    match &args[0] {
        Value::Integer(v) => Ok(Value::Float(*v as f64)),
        Value::Float(v) => Ok(Value::Float(*v)),
        Value::Boolean(b) => Ok(Value::Float(*b as i64 as f64)),
        Value::Str(s) => s.trim().parse().map(Value::Float).map_err(|_| {
            Exception::new(
                ErrorKind::Argument,
                format!("invalid literal for float(): '{}'", s),
                span,
            )
        }),
        other => Err(unsupported("float", other, span)),
    }
}

fn type_of(_: &mut Interpreter, args: Vec<Value>, _span: Span) -> EvalResult {
    Ok(Value::str(args[0].type_name()))
}

fn range(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let bounds: Vec<i64> = args
        .iter()
        .map(|a| want_int("range", a, span))
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match bounds.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => unreachable!("arity already checked"),
    };
    if step == 0 {
        return Err(Exception::new(
            ErrorKind::Argument,
            "range() step must not be zero",
            span,
        ));
    }

    let mut values = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        values.push(Value::Integer(i));
        i += step;
    }
    Ok(Value::list(values))
}

fn sum(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let elements = iter_elements(&args[0]).ok_or_else(|| unsupported("sum", &args[0], span))?;

    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut saw_float = false;
    for v in &elements {
        match v {
            Value::Integer(n) => int_total = int_total.wrapping_add(*n),
            Value::Float(n) => {
                saw_float = true;
                float_total += n;
            }
            other => return Err(unsupported("sum", other, span)),
        }
    }
    if saw_float {
        Ok(Value::Float(float_total + int_total as f64))
    } else {
        Ok(Value::Integer(int_total))
    }
}

fn extremum(name: &str, args: Vec<Value>, span: Span, keep: Ordering) -> EvalResult {
    let elements = iter_elements(&args[0]).ok_or_else(|| unsupported(name, &args[0], span))?;
    let mut best: Option<Value> = None;
    for v in elements {
        best = Some(match best {
            None => v,
            Some(b) => {
                let ord = compare(&v, &b).ok_or_else(|| {
                    Exception::new(
                        ErrorKind::Type,
                        format!("'{}' values are not comparable", name),
                        span,
                    )
                })?;
                if ord == keep {
                    v
                } else {
                    b
                }
            }
        });
    }
    best.ok_or_else(|| {
        Exception::new(
            ErrorKind::Argument,
            format!("{}() arg is an empty sequence", name),
            span,
        )
    })
}

fn min(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    extremum("min", args, span, Ordering::Less)
}

fn max(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    extremum("max", args, span, Ordering::Greater)
}

fn abs(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    match &args[0] {
        Value::Integer(v) => Ok(Value::Integer(v.abs())),
        Value::Float(v) => Ok(Value::Float(v.abs())),
        other => Err(unsupported("abs", other, span)),
    }
}

fn sorted(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let mut elements =
        iter_elements(&args[0]).ok_or_else(|| unsupported("sorted", &args[0], span))?;

    for window in elements.windows(2) {
        if compare(&window[0], &window[1]).is_none() {
            return Err(Exception::new(
                ErrorKind::Type,
                "'sorted' values are not comparable",
                span,
            ));
        }
    }
    elements.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
    Ok(Value::list(elements))
}

fn reverse(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let mut elements =
        iter_elements(&args[0]).ok_or_else(|| unsupported("reverse", &args[0], span))?;
    elements.reverse();
    Ok(Value::list(elements))
}

fn append(_: &mut Interpreter, mut args: Vec<Value>, span: Span) -> EvalResult {
    let value = args.pop().unwrap();
    let list = want_list("append", &args[0], span)?;
    list.borrow_mut().push(value);
    Ok(args.swap_remove(0))
}

fn pop(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let list = want_list("pop", &args[0], span)?;
    let popped = list.borrow_mut().pop();
    popped.ok_or_else(|| Exception::new(ErrorKind::Runtime, "pop from empty list", span))
}

fn slice(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let start = want_int("slice", &args[1], span)?;
    let end = match args.get(2) {
        Some(Value::Null) | None => None,
        Some(v) => Some(want_int("slice", v, span)?),
    };

    fn clamp(index: i64, len: usize) -> usize {
        let len = len as i64;
        let i = if index < 0 { index + len } else { index };
        i.clamp(0, len) as usize
    }

    match &args[0] {
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let lo = clamp(start, chars.len());
            let hi = end.map_or(chars.len(), |e| clamp(e, chars.len()));
            let out: String = if lo < hi { chars[lo..hi].iter().collect() } else { String::new() };
            Ok(Value::str(out))
        }
        Value::List(l) => {
            let items = l.borrow();
            let lo = clamp(start, items.len());
            let hi = end.map_or(items.len(), |e| clamp(e, items.len()));
            let out = if lo < hi { items[lo..hi].to_vec() } else { Vec::new() };
            Ok(Value::list(out))
        }
        Value::Tuple(t) => {
            let lo = clamp(start, t.len());
            let hi = end.map_or(t.len(), |e| clamp(e, t.len()));
            let out = if lo < hi { t[lo..hi].to_vec() } else { Vec::new() };
            Ok(Value::Tuple(Rc::new(out)))
        }
        other => Err(unsupported("slice", other, span)),
    }
}

fn join(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let elements = iter_elements(&args[0]).ok_or_else(|| unsupported("join", &args[0], span))?;
    let sep = match args.get(1) {
        Some(v) => want_str("join", v, span)?.to_string(),
        None => String::new(),
    };
    let joined = elements
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(&sep);
    Ok(Value::str(joined))
}

fn split(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let s = want_str("split", &args[0], span)?;
    let parts: Vec<Value> = match args.get(1) {
        Some(Value::Null) | None => s.split_whitespace().map(Value::str).collect(),
        Some(v) => {
            let sep = want_str("split", v, span)?;
            if sep.is_empty() {
                return Err(Exception::new(ErrorKind::Argument, "empty separator", span));
            }
            s.split(sep.as_ref()).map(Value::str).collect()
        }
    };
    Ok(Value::list(parts))
}

fn strip(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    Ok(Value::str(want_str("strip", &args[0], span)?.trim()))
}

fn upper(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    Ok(Value::str(want_str("upper", &args[0], span)?.to_uppercase()))
}

fn lower(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    Ok(Value::str(want_str("lower", &args[0], span)?.to_lowercase()))
}

fn replace(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let s = want_str("replace", &args[0], span)?;
    let old = want_str("replace", &args[1], span)?;
    let new = want_str("replace", &args[2], span)?;
    if old.is_empty() {
        return Err(Exception::new(ErrorKind::Argument, "empty pattern", span));
    }
    Ok(Value::str(s.replace(old.as_ref(), new.as_ref())))
}

fn find(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let s = want_str("find", &args[0], span)?;
    let sub = want_str("find", &args[1], span)?;
    match s.find(sub.as_ref()) {
        Some(byte_index) => Ok(Value::Integer(s[..byte_index].chars().count() as i64)),
        None => Ok(Value::Integer(-1)),
    }
}

fn startswith(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let s = want_str("startswith", &args[0], span)?;
    let prefix = want_str("startswith", &args[1], span)?;
    Ok(Value::Boolean(s.starts_with(prefix.as_ref())))
}

fn endswith(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let s = want_str("endswith", &args[0], span)?;
    let suffix = want_str("endswith", &args[1], span)?;
    Ok(Value::Boolean(s.ends_with(suffix.as_ref())))
}

fn dict(_: &mut Interpreter, _args: Vec<Value>, _span: Span) -> EvalResult {
    Ok(Value::Dict(Rc::new(RefCell::new(IndexMap::new()))))
}

fn dict_get(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let map = want_dict("dict_get", &args[0], span)?;
    let key = Key::from_value(&args[1], span)?;
    let fallback = args.get(2).cloned().unwrap_or(Value::Null);
    let value = map.borrow().get(&key).cloned().unwrap_or(fallback);
    Ok(value)
}

fn dict_set(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let map = want_dict("dict_set", &args[0], span)?;
    let key = Key::from_value(&args[1], span)?;
    map.borrow_mut().insert(key, args[2].clone());
    Ok(args[0].clone())
}

fn dict_keys(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let map = want_dict("dict_keys", &args[0], span)?;
    let keys = map.borrow().keys().map(Key::to_value).collect();
    Ok(Value::list(keys))
}

fn dict_values(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let map = want_dict("dict_values", &args[0], span)?;
    let values = map.borrow().values().cloned().collect();
    Ok(Value::list(values))
}

fn set(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let mut entries = IndexSet::new();
    for arg in &args {
        entries.insert(Key::from_value(arg, span)?);
    }
    Ok(Value::Set(Rc::new(RefCell::new(entries))))
}

fn tuple(_: &mut Interpreter, args: Vec<Value>, _span: Span) -> EvalResult {
    Ok(Value::Tuple(Rc::new(args)))
}

fn sqrt(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let x = want_number("sqrt", &args[0], span)?;
    if x < 0.0 {
        return Err(Exception::new(ErrorKind::Runtime, "math domain error", span));
    }
    Ok(Value::Float(x.sqrt()))
}

fn pow(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let x = want_number("pow", &args[0], span)?;
    let y = want_number("pow", &args[1], span)?;
    Ok(Value::Float(x.powf(y)))
}

fn floor(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    Ok(Value::Integer(want_number("floor", &args[0], span)?.floor() as i64))
}

fn ceil(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    Ok(Value::Integer(want_number("ceil", &args[0], span)?.ceil() as i64))
}

fn error_value(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let message = match &args[0] {
        Value::Str(s) => s.to_string(),
        other => other.to_string(),
    };
    Ok(Value::Error(Rc::new(Exception::new(
        ErrorKind::Error,
        message,
        span,
    ))))
}

fn sleep(interp: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let seconds = want_number("sleep", &args[0], span)?.max(0.0);
    let task = interp.scheduler.timer(Duration::from_secs_f64(seconds));
    Ok(Value::Task(task))
}

fn time(_: &mut Interpreter, _args: Vec<Value>, _span: Span) -> EvalResult {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Float(now.as_secs_f64()))
}

fn open(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let path = want_str("open", &args[0], span)?;
    let mode = match args.get(1) {
        Some(v) => want_str("open", v, span)?.to_string(),
        None => "r".to_string(),
    };

    let mut options = OpenOptions::new();
    let writable = match mode.as_str() {
        "r" => {
            options.read(true);
            false
        }
        "w" => {
            options.write(true).create(true).truncate(true);
            true
        }
        "a" => {
            options.append(true).create(true);
            true
        }
        other => {
            return Err(Exception::new(
                ErrorKind::Argument,
                format!("invalid mode: '{}'", other),
                span,
            ))
        }
    };

    let file = options.open(path.as_ref()).map_err(|e| {
        Exception::new(
            ErrorKind::Runtime,
            format!("cannot open '{}': {}", path, e),
            span,
        )
    })?;
    Ok(Value::File(Rc::new(RefCell::new(FileHandle {
        path: path.to_string(),
        file: Some(file),
        writable,
    }))))
}

fn read(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let handle = want_file("read", &args[0], span)?;
    let mut handle = handle.borrow_mut();
    let file = handle
        .file
        .as_mut()
        .ok_or_else(|| Exception::new(ErrorKind::Runtime, "I/O operation on closed file", span))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| Exception::new(ErrorKind::Runtime, format!("read failed: {}", e), span))?;
    Ok(Value::str(contents))
}

fn write(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let handle = want_file("write", &args[0], span)?;
    let data = want_str("write", &args[1], span)?;
    let mut handle = handle.borrow_mut();
    if !handle.writable {
        return Err(Exception::new(
            ErrorKind::Runtime,
            "file not open for writing",
            span,
        ));
    }
    let file = handle
        .file
        .as_mut()
        .ok_or_else(|| Exception::new(ErrorKind::Runtime, "I/O operation on closed file", span))?;
    file.write_all(data.as_bytes())
        .map_err(|e| Exception::new(ErrorKind::Runtime, format!("write failed: {}", e), span))?;
    Ok(Value::Integer(data.chars().count() as i64))
}

fn close(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let handle = want_file("close", &args[0], span)?;
    handle.borrow_mut().file = None;
    Ok(Value::Null)
}

fn run(interp: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let path = want_str("run", &args[0], span)?;
    interp.run_script(path.as_ref(), span)
}

fn run_async(interp: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let path = want_str("run_async", &args[0], span)?;
    interp.spawn_script(path.as_ref(), span)
}

fn exit(_: &mut Interpreter, args: Vec<Value>, span: Span) -> EvalResult {
    let code = match args.first() {
        Some(v) => want_int("exit", v, span)?,
        None => 0,
    };
    std::process::exit(code as i32);
}
