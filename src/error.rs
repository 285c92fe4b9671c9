use std::fmt;

use crate::token::{FileId, Span};

/// The category of an exception, used for `except` clause matching and as
/// the leading word of a rendered diagnostic.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    Syntax,
    Name,
    Type,
    Argument,
    Runtime,
    Import,
    /// The default tag for user-raised errors built with `Error(msg)`.
    Error,
    /// A user-defined exception tag, named after the function that built it.
    Custom(String),
}

impl ErrorKind {
    pub fn tag(&self) -> &str {
        match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Name => "NameError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Import => "ImportError",
            ErrorKind::Error => "Error",
            ErrorKind::Custom(name) => name,
        }
    }

    /// Whether an `except <clause>` clause catches this kind. `Error` is the
    /// universal super-tag; everything else matches by name.
    pub fn matches(&self, clause: &str) -> bool {
        clause == "Error" || clause == self.tag()
    }
}

/// A raised error: what went wrong, where, and the call sites it unwound
/// through. Also the payload of `Value::Error`, so a caught exception can be
/// bound with `as` and printed.
#[derive(Clone, Debug, PartialEq)]
pub struct Exception {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Option<Span>,
    pub hint: Option<String>,
    pub trace: Vec<Span>,
}

impl Exception {
    pub fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Exception {
            kind,
            message: message.into(),
            span: Some(span),
            hint: None,
            trace: Vec::new(),
        }
    }

    pub fn spanless(kind: ErrorKind, message: impl Into<String>) -> Self {
        Exception {
            kind,
            message: message.into(),
            span: None,
            hint: None,
            trace: Vec::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Records a call site the error propagated through.
    pub fn push_trace(&mut self, span: Span) {
        self.trace.push(span);
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One registered source buffer: a file on disk or a `-C` command string.
#[derive(Debug)]
struct SourceFile {
    name: String,
    text: String,
}

/// Owns every source buffer the interpreter has parsed so spans stay
/// resolvable for the lifetime of the run.
#[derive(Debug, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap::default()
    }

    pub fn add(&mut self, name: impl Into<String>, text: impl Into<String>) -> FileId {
        self.files.push(SourceFile {
            name: name.into(),
            text: text.into(),
        });
        FileId(self.files.len() as u32 - 1)
    }

    pub fn name(&self, file: FileId) -> &str {
        self.files
            .get(file.0 as usize)
            .map_or("<unknown>", |f| f.name.as_str())
    }

    fn line_text(&self, file: FileId, line: u32) -> Option<&str> {
        let text = &self.files.get(file.0 as usize)?.text;
        text.lines().nth(line.saturating_sub(1) as usize)
    }

    /// Renders one `File "...", line L, col C` stanza with the source line
    /// and a caret under the offending column.
    fn render_frame(&self, span: Span, indent: &str, out: &mut String) {
        out.push_str(&format!(
            "{}  File \"{}\", line {}, col {}\n",
            indent,
            self.name(span.file),
            span.line,
            span.column
        ));
        if let Some(line) = self.line_text(span.file, span.line) {
            out.push_str(&format!("{}    {}\n", indent, line));
            let pad = " ".repeat(span.column.saturating_sub(1) as usize);
            out.push_str(&format!("{}    {}^\n", indent, pad));
        }
    }

    /// Formats an exception in the user-facing diagnostic layout:
    ///
    /// ```text
    /// Kind: message
    ///   File "path", line L, col C
    ///     source line
    ///     ^
    /// ```
    ///
    /// Call sites the error unwound through are rendered as indented
    /// stanzas below the primary frame.
    pub fn render(&self, error: &Exception) -> String {
        let mut out = String::new();
        out.push_str(error.kind.tag());
        out.push_str(": ");
        out.push_str(&error.message);
        if let Some(hint) = &error.hint {
            out.push(' ');
            out.push_str(hint);
        }
        out.push('\n');
        if let Some(span) = error.span {
            self.render_frame(span, "", &mut out);
        }
        for frame in &error.trace {
            self.render_frame(*frame, "  ", &mut out);
        }
        out
    }
}
