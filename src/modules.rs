use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::ast::{ImportTarget, Program};
use crate::error::{ErrorKind, Exception};
use crate::evaluator::Interpreter;
use crate::lexer::Lexer;
use crate::object::{Env, EvalResult, Value};
use crate::parser::Parser;
use crate::scheduler::TaskKind;
use crate::token::Span;

/// ASTs and evaluated module frames, both keyed by absolute path. A module's
/// frame goes into the cache *before* its body runs, so circular imports see
/// the partially populated frame instead of recursing forever.
#[derive(Debug, Default)]
pub struct ModuleCache {
    programs: HashMap<PathBuf, Rc<Program>>,
    frames: HashMap<PathBuf, Env>,
}

impl ModuleCache {
    pub fn new() -> ModuleCache {
        ModuleCache::default()
    }
}

impl Interpreter {
    /// Reads and parses a file, caching the AST by absolute path. `kind`
    /// selects the error category (`ImportError` for imports, otherwise
    /// `RuntimeError`).
    fn load_program(
        &mut self,
        path: &Path,
        kind: ErrorKind,
        span: Span,
    ) -> Result<(PathBuf, Rc<Program>), Exception> {
        let absolute = fs::canonicalize(path).map_err(|_| {
            Exception::new(
                kind.clone(),
                format!("cannot open '{}'", path.display()),
                span,
            )
        })?;

        if let Some(program) = self.modules.programs.get(&absolute) {
            return Ok((absolute, Rc::clone(program)));
        }

        let text = fs::read_to_string(&absolute).map_err(|e| {
            Exception::new(kind, format!("cannot read '{}': {}", path.display(), e), span)
        })?;
        let file = self.sources.add(absolute.display().to_string(), text.as_str());
        let tokens = Lexer::new(&text, file).tokenize()?;
        let program = Rc::new(Parser::new(tokens).parse_program()?);

        self.modules
            .programs
            .insert(absolute.clone(), Rc::clone(&program));
        Ok((absolute, program))
    }

    /// Evaluates a program with `script_dir` temporarily pointing at the
    /// file's directory, so its own imports resolve next to it.
    fn eval_in_dir(&mut self, program: &Program, dir: Option<PathBuf>, env: &Env) -> EvalResult {
        let saved = self.script_dir.take();
        self.script_dir = dir;
        let outcome = self.eval_block(&program.statements, env);
        self.script_dir = saved;
        outcome?;
        Ok(Value::Null)
    }

    /// `run(path)`: evaluate a script in the current global frame, so its
    /// definitions and mutations are visible to the caller.
    pub fn run_script(&mut self, path: &str, span: Span) -> EvalResult {
        let (absolute, program) = self.load_program(Path::new(path), ErrorKind::Runtime, span)?;
        let globals = self.globals.clone();
        self.eval_in_dir(&program, absolute.parent().map(Path::to_path_buf), &globals)
    }

    /// `run_async(path)`: parse now (reusing the cache), execute as a task.
    pub fn spawn_script(&mut self, path: &str, span: Span) -> EvalResult {
        let (absolute, _) = self.load_program(Path::new(path), ErrorKind::Runtime, span)?;
        let task = self.scheduler.spawn(TaskKind::Script {
            path: absolute,
            span,
        });
        Ok(Value::Task(task))
    }

    /// The body of a `Script` task; the AST is already cached from spawn.
    pub(crate) fn eval_script_task(&mut self, path: &Path, span: Span) -> EvalResult {
        let (absolute, program) = self.load_program(path, ErrorKind::Runtime, span)?;
        let globals = self.globals.clone();
        self.eval_in_dir(&program, absolute.parent().map(Path::to_path_buf), &globals)
    }

    /// `import`: resolve, evaluate once in a fresh frame, then copy the
    /// module's top-level bindings into the importing scope.
    pub fn import_module(
        &mut self,
        target: &ImportTarget,
        env: &Env,
        span: Span,
    ) -> Result<(), Exception> {
        let (display_name, candidates) = self.import_candidates(target);

        let found = candidates.iter().find(|p| p.is_file()).ok_or_else(|| {
            Exception::new(
                ErrorKind::Import,
                format!("module '{}' not found", display_name),
                span,
            )
        })?;

        let (absolute, program) = self.load_program(found, ErrorKind::Import, span)?;

        if let Some(frame) = self.modules.frames.get(&absolute) {
            bind_top_level(&frame.clone(), env);
            return Ok(());
        }

        let module_env = Env::extend(&self.globals);
        self.modules
            .frames
            .insert(absolute.clone(), module_env.clone());
        self.eval_in_dir(&program, absolute.parent().map(Path::to_path_buf), &module_env)?;

        bind_top_level(&module_env, env);
        Ok(())
    }

    /// Resolution order: string imports name a path directly; identifier
    /// imports search the working directory, then the running script's own
    /// directory, each as `<name>.vlang` then `<name>/__init__.vlang`.
    fn import_candidates(&self, target: &ImportTarget) -> (String, Vec<PathBuf>) {
        match target {
            ImportTarget::Path(path) => {
                let file = if path.ends_with(".vlang") {
                    PathBuf::from(path)
                } else {
                    PathBuf::from(format!("{}.vlang", path))
                };
                let init = Path::new(path).join("__init__.vlang");
                (path.clone(), vec![file, init])
            }
            ImportTarget::Name(name) => {
                let mut candidates = vec![
                    PathBuf::from(format!("{}.vlang", name)),
                    Path::new(name).join("__init__.vlang"),
                ];
                if let Some(dir) = &self.script_dir {
                    candidates.push(dir.join(format!("{}.vlang", name)));
                    candidates.push(dir.join(name).join("__init__.vlang"));
                }
                (name.clone(), candidates)
            }
        }
    }
}

fn bind_top_level(frame: &Env, env: &Env) {
    for name in frame.local_names() {
        if let Some(value) = frame.get(&name) {
            env.set_local(&name, value);
        }
    }
}
