use std::path::PathBuf;
use std::process::exit;

use clap::{CommandFactory, Parser};

/// The VirtoLang interpreter.
#[derive(Parser, Debug)]
#[command(name = "vlang", version, about, long_about = None)]
struct Args {
    /// The .vlang file to run.
    file: Option<PathBuf>,

    /// Run code directly instead of a file.
    #[arg(short = 'C', long = "code", value_name = "CODE")]
    code: Option<String>,
}

fn main() {
    // clap itself exits with code 2 on CLI misuse.
    let args = Args::parse();

    let result = if let Some(code) = args.code {
        vlang::run_source(&code, "<inline>")
    } else if let Some(file) = args.file {
        if file.extension().and_then(|e| e.to_str()) != Some("vlang") {
            eprintln!("Error: {} is not a .vlang file.", file.display());
            exit(1);
        }
        vlang::run_script_file(&file)
    } else {
        let _ = Args::command().print_help();
        eprintln!("\nError: must provide a file or use -C/--code to run code.");
        exit(2);
    };

    if let Err(diagnostics) = result {
        eprint!("{}", diagnostics);
        exit(1);
    }
}
