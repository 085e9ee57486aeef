use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use config_core::{
    diff_configs, format_config, has_blocking, merge_path, validate_config, Diagnostic,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Validate, format, and diff padforge config bundles", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge and validate a config file or directory.
    Validate { path: PathBuf },
    /// Print the canonical rendering of a merged bundle.
    Format { path: PathBuf },
    /// Structural diff between two bundles.
    Diff { path_a: PathBuf, path_b: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { path } => validate(path),
        Command::Format { path } => format(path),
        Command::Diff { path_a, path_b } => diff(path_a, path_b),
    }
}

fn validate(path: PathBuf) -> ExitCode {
    let merged = match merge_path(&path) {
        Ok(merged) => merged,
        Err(err) => {
            eprintln!("Merge failed: {err}");
            return ExitCode::from(1);
        }
    };
    let issues = validate_config(&merged.config, &merged.files);
    if issues.is_empty() {
        println!("Validation OK: {}", path.display());
        return ExitCode::SUCCESS;
    }
    print_diagnostics(&issues);
    if has_blocking(&issues) {
        ExitCode::from(2)
    } else {
        // Warnings never affect the exit code.
        ExitCode::SUCCESS
    }
}

fn format(path: PathBuf) -> ExitCode {
    match merge_path(&path).and_then(|merged| {
        format_config(&merged.config).map_err(|source| config_core::MergeError::Schema { source })
    }) {
        Ok(rendered) => {
            print!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Format failed: {err}");
            ExitCode::from(1)
        }
    }
}

fn diff(path_a: PathBuf, path_b: PathBuf) -> ExitCode {
    let (a, b) = match (merge_path(&path_a), merge_path(&path_b)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("Diff failed: {err}");
            return ExitCode::from(1);
        }
    };
    let entries = diff_configs(&a, &b);
    if entries.is_empty() {
        println!("Bundles are identical.");
        return ExitCode::SUCCESS;
    }
    for entry in &entries {
        println!("{entry}");
    }
    ExitCode::from(1)
}

fn print_diagnostics(issues: &[Diagnostic]) {
    eprintln!("Validation diagnostics:");
    for issue in issues {
        eprintln!("- {issue}");
    }
}
