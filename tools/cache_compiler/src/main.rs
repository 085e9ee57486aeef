use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cache_compiler::{compile_path, CompileError};
use cache_model::CACHE_SCHEMA_VERSION;
use clap::Parser;
use config_core::Diagnostic;

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile padforge config bundles into cache artifacts", long_about = None)]
struct Cli {
    /// Path to a YAML config file or a directory of config files.
    config: PathBuf,
    /// Output cache file path (defaults to `<stem>.v<schema>.cache`).
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let out_path = cli.out.unwrap_or_else(|| default_output_path(&cli.config));

    match compile_path(&cli.config) {
        Ok(output) => {
            print_diagnostics(&output.diagnostics);
            let bytes = output.bundle.encode().context("encoding cache bundle")?;
            fs::write(&out_path, bytes)
                .with_context(|| format!("writing cache to {}", out_path.display()))?;
            println!(
                "Cache generated at {} ({} macros, {} triggers)",
                out_path.display(),
                output.bundle.body.macros.len(),
                output.bundle.body.triggers.len()
            );
            Ok(())
        }
        Err(CompileError::Validation(diags)) => {
            print_diagnostics(&diags);
            eprintln!("Cache build failed due to validation errors.");
            std::process::exit(2);
        }
        Err(err) => Err(err.into()),
    }
}

fn default_output_path(config_path: &Path) -> PathBuf {
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    config_path.with_file_name(format!("{stem}.v{CACHE_SCHEMA_VERSION}.cache"))
}

fn print_diagnostics(diags: &[Diagnostic]) {
    if diags.is_empty() {
        return;
    }
    eprintln!("Diagnostics:");
    for diag in diags {
        eprintln!("- {diag}");
    }
}
