use std::cell::RefCell;
use std::rc::Rc;

use tempfile::TempDir;
use vlang::evaluator::Interpreter;

/// Runs a script with captured stdout, returning the run result (rendered
/// diagnostics on failure) and everything it printed.
fn run_capture(source: &str) -> (Result<(), String>, String) {
    run_capture_in(source, None)
}

fn run_capture_in(source: &str, dir: Option<&TempDir>) -> (Result<(), String>, String) {
    let sink: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut interp = Interpreter::new();
    interp.set_output(sink.clone());
    if let Some(dir) = dir {
        interp.script_dir = Some(dir.path().to_path_buf());
    }

    let result = match interp.eval_source(source, "<test>") {
        Ok(_) => {
            let failures = interp.finish();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures
                    .iter()
                    .map(|f| interp.sources.render(f))
                    .collect::<String>())
            }
        }
        Err(error) => Err(interp.sources.render(&error)),
    };

    let output = String::from_utf8(sink.borrow().clone()).expect("output was not UTF-8");
    (result, output)
}

fn assert_output(source: &str, expected: &str) {
    let (result, output) = run_capture(source);
    if let Err(diagnostics) = result {
        panic!("script failed:\n{}\nfor:\n{}", diagnostics, source);
    }
    assert_eq!(expected, output, "for:\n{}", source);
}

fn assert_failure_contains(source: &str, needle: &str) {
    let (result, _) = run_capture(source);
    match result {
        Ok(()) => panic!("script succeeded but was expected to fail:\n{}", source),
        Err(diagnostics) => assert!(
            diagnostics.contains(needle),
            "diagnostics did not contain {:?}:\n{}",
            needle,
            diagnostics
        ),
    }
}

#[test]
fn integer_division_prints_a_float() {
    assert_output("print(6 / 2)", "3.0\n");
}

#[test]
fn function_definition_and_call() {
    assert_output("def add(a,b){ return a+b }\nprint(add(2,3))", "5\n");
}

#[test]
fn fizzbuzz() {
    let source = r#"
for (i in range(1, 16)) {
    if (i % 15 == 0) { print("FizzBuzz") }
    elif (i % 3 == 0) { print("Fizz") }
    elif (i % 5 == 0) { print("Buzz") }
    else { print(i) }
}
"#;
    assert_output(
        source,
        "1\n2\nFizz\n4\nBuzz\nFizz\n7\n8\nFizz\nBuzz\n11\nFizz\n13\n14\nFizzBuzz\n",
    );
}

#[test]
fn try_except_finally() {
    assert_output(
        r#"try { raise Error("fail!") } except Error as e { print(e) } finally { print("done") }"#,
        "fail!\ndone\n",
    );
}

#[test]
fn async_await_round_trip() {
    assert_output(
        "async def f(){ await sleep(0); return 42 }\nt = f(); print(await t)",
        "42\n",
    );
}

#[test]
fn is_not_works_and_dangling_not_suggests() {
    assert_output("if (5 is not 3) { print(\"yes\") }", "yes\n");
    assert_failure_contains(
        "if (5 is not) { print(\"no\") }",
        "Did you mean 'not in' or 'is not'?",
    );
}

#[test]
fn diagnostics_carry_file_line_col_and_caret() {
    let (result, _) = run_capture("y = missing");
    let rendered = result.unwrap_err();
    assert_eq!(
        rendered,
        "NameError: Undefined variable: missing\n  File \"<test>\", line 1, col 5\n    y = missing\n        ^\n"
    );
}

#[test]
fn uncaught_errors_inside_calls_show_the_call_site() {
    let (result, _) = run_capture("def f() { return missing }\nf()");
    let rendered = result.unwrap_err();
    assert!(rendered.starts_with("NameError: Undefined variable: missing\n"));
    // the call frame stanza is indented under the primary one
    assert!(rendered.contains("\n    File \"<test>\", line 2, col 1\n"));
}

#[test]
fn print_takes_multiple_arguments() {
    assert_output("print(1, \"two\", 3.0, true, null)", "1 two 3.0 true null\n");
}

#[test]
fn while_and_closures() {
    assert_output(
        r#"
def counter() {
    n = 0
    def tick() {
        n = n + 1
        return n
    }
    return tick
}
c = counter()
c()
c()
print(c())
"#,
        "3\n",
    );
}

#[test]
fn containers_share_mutations_across_aliases() {
    assert_output(
        "a = [1, 2]\nb = a\nappend(b, 3)\nprint(a)\nprint(a is b)\nprint(a == [1, 2, 3])",
        "[1, 2, 3]\ntrue\ntrue\n",
    );
}

#[test]
fn import_binds_module_top_level_names() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("mathlib.vlang"),
        "def triple(x) { return x * 3 }\nTAU = 6.28\n",
    )
    .unwrap();

    assert_module_output(
        &dir,
        "import mathlib\nprint(triple(7))\nprint(TAU)",
        "21\n6.28\n",
    );
}

#[test]
fn import_by_string_path() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("lib.vlang"), "greeting = \"hi\"\n").unwrap();

    let path = dir.path().join("lib");
    let source = format!("import \"{}\"\nprint(greeting)", path.display());
    assert_module_output(&dir, &source, "hi\n");
}

#[test]
fn package_init_files_resolve() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir(dir.path().join("pkg")).unwrap();
    std::fs::write(dir.path().join("pkg/__init__.vlang"), "flag = true\n").unwrap();

    assert_module_output(&dir, "import pkg\nprint(flag)", "true\n");
}

#[test]
fn modules_are_cached_and_evaluated_once() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("noisy.vlang"),
        "print(\"loading\")\nvalue = 1\n",
    )
    .unwrap();

    assert_module_output(
        &dir,
        "import noisy\nimport noisy\nprint(value)",
        "loading\n1\n",
    );
}

#[test]
fn circular_imports_terminate() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.vlang"), "import b\na_name = \"a\"\n").unwrap();
    std::fs::write(dir.path().join("b.vlang"), "import a\nb_name = \"b\"\n").unwrap();

    assert_module_output(&dir, "import a\nprint(a_name)\nprint(b_name)", "a\nb\n");
}

#[test]
fn missing_modules_raise_import_error() {
    let (result, _) = run_capture("import missing_mod");
    let rendered = result.unwrap_err();
    assert!(rendered.starts_with("ImportError: module 'missing_mod' not found\n"));
}

#[test]
fn import_errors_are_catchable() {
    assert_output(
        "try { import missing_mod } except ImportError { print(\"nope\") }",
        "nope\n",
    );
}

#[test]
fn run_evaluates_in_the_callers_global_frame() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("setup.vlang"),
        "print(base + 1)\nextra = 10\n",
    )
    .unwrap();

    let path = dir.path().join("setup.vlang");
    let source = format!("base = 5\nrun(\"{}\")\nprint(extra)", path.display());
    assert_module_output(&dir, &source, "6\n10\n");
}

#[test]
fn legacy_run_statement_form() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("hello.vlang"), "print(\"hello\")\n").unwrap();

    let path = dir.path().join("hello.vlang");
    let source = format!("run \"{}\"", path.display());
    assert_module_output(&dir, &source, "hello\n");
}

#[test]
fn run_async_defers_execution_until_awaited_or_drained() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("job.vlang"), "print(\"job\")\n").unwrap();

    let path = dir.path().join("job.vlang");
    let source = format!(
        "t = run_async(\"{}\")\nprint(\"main\")\nawait t",
        path.display()
    );
    assert_module_output(&dir, &source, "main\njob\n");
}

#[test]
fn failing_unawaited_task_reports_at_shutdown() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("bad.vlang"), "raise Error(\"task broke\")\n").unwrap();

    let path = dir.path().join("bad.vlang");
    let source = format!("t = run_async(\"{}\")\nprint(\"fine\")", path.display());
    let (result, output) = run_capture_in(&source, Some(&dir));

    assert_eq!(output, "fine\n");
    let rendered = result.unwrap_err();
    assert!(rendered.starts_with("Error: task broke\n"));
}

#[test]
fn file_io_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("out.txt");

    let source = format!(
        "f = open(\"{p}\", \"w\")\nwrite(f, \"hello file\")\nclose(f)\ng = open(\"{p}\")\nprint(read(g))\nclose(g)",
        p = path.display()
    );
    assert_module_output(&dir, &source, "hello file\n");
}

#[test]
fn closed_files_reject_io() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("x.txt");
    std::fs::write(&path, "data").unwrap();

    let source = format!(
        "f = open(\"{}\")\nclose(f)\nread(f)",
        path.display()
    );
    let (result, _) = run_capture_in(&source, Some(&dir));
    assert!(result
        .unwrap_err()
        .starts_with("RuntimeError: I/O operation on closed file"));
}

fn assert_module_output(dir: &TempDir, source: &str, expected: &str) {
    let (result, output) = run_capture_in(source, Some(dir));
    if let Err(diagnostics) = result {
        panic!("script failed:\n{}\nfor:\n{}", diagnostics, source);
    }
    assert_eq!(expected, output, "for:\n{}", source);
}
