pub mod ast;
pub mod error;
pub mod evaluator;
pub mod lexer;
pub mod modules;
pub mod object;
pub mod parser;
pub mod scheduler;
pub mod token;

use std::path::Path;

use crate::evaluator::Interpreter;

/// Parses and runs a source buffer in a fresh interpreter, then drains the
/// task queue. On failure the error is returned already rendered in the
/// user-facing diagnostic format.
pub fn run_source(source: &str, name: &str) -> Result<(), String> {
    let mut interp = Interpreter::new();
    run_to_completion(&mut interp, source, name)
}

/// Runs a `.vlang` file; the script's own directory joins the import
/// search path.
pub fn run_script_file(path: &Path) -> Result<(), String> {
    let source = std::fs::read_to_string(path)
        .map_err(|_| format!("Error: {} is not a valid file.\n", path.display()))?;

    let mut interp = Interpreter::new();
    interp.script_dir = path
        .canonicalize()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf));
    run_to_completion(&mut interp, &source, &path.display().to_string())
}

fn run_to_completion(interp: &mut Interpreter, source: &str, name: &str) -> Result<(), String> {
    if let Err(error) = interp.eval_source(source, name) {
        // Tasks already spawned still get their shot; their failures ride
        // along behind the primary error.
        let mut rendered = interp.sources.render(&error);
        for failure in interp.finish() {
            rendered.push_str(&interp.sources.render(&failure));
        }
        return Err(rendered);
    }

    let failures = interp.finish();
    if failures.is_empty() {
        return Ok(());
    }
    Err(failures
        .iter()
        .map(|failure| interp.sources.render(failure))
        .collect())
}
