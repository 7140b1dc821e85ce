//! The `format` tool: pretty-prints all ECAL sources below a directory.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

/// Formats every `*.ecal` file below `dir` in place.
pub fn format_dir(dir: &Path) -> ExitCode {
    let mut files = Vec::new();
    collect_sources(dir, &mut files);
    let mut failed = false;
    for path in files {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                eprintln!("error: cannot read {}: {err}", path.display());
                failed = true;
                continue;
            }
        };
        let name = path.display().to_string();
        match ecal::parse(&name, &text) {
            Ok(ast) => {
                let mut formatted = ast.to_source();
                if !formatted.ends_with('\n') {
                    formatted.push('\n');
                }
                if formatted != text {
                    if let Err(err) = std::fs::write(&path, formatted) {
                        eprintln!("error: cannot write {}: {err}", path.display());
                        failed = true;
                    }
                }
            }
            Err(err) => {
                eprintln!("{err}");
                failed = true;
            }
        }
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "ecal") {
            out.push(path);
        }
    }
}
