//! Offline entity maps for files and directories.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::compile::Compiler;
use crate::service::analyze_file;
use crate::signature::Classifier;
use crate::tree::CodeEntity;

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FileReport {
    Mapped {
        path: String,
        entities: Vec<CodeEntity>,
    },
    Failed {
        path: String,
        error: String,
    },
}

/// Files named directly are kept whatever their extension; directories are
/// walked for `*.py`. Sorted and deduplicated.
pub fn collect_sources(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            files.extend(walk_python_files(path));
        } else if path.exists() {
            files.push(path.clone());
        } else {
            anyhow::bail!("No such file or directory: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn walk_python_files(base_path: &Path) -> Vec<PathBuf> {
    let (tx, rx) = mpsc::channel::<PathBuf>();
    let walker = WalkBuilder::new(base_path)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "py") {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    rx.iter().collect()
}

pub fn dump<C: Compiler + Sync>(
    compiler: &C,
    classifier: &Classifier,
    files: &[PathBuf],
) -> Vec<FileReport> {
    files
        .par_iter()
        .map(|file| {
            let path = file.display().to_string();
            match analyze_file(compiler, classifier, file) {
                Ok(entities) => FileReport::Mapped { path, entities },
                Err(err) => FileReport::Failed {
                    path,
                    error: format!("{err:#}"),
                },
            }
        })
        .collect()
}

pub fn render_json(reports: &[FileReport]) -> Result<String> {
    serde_json::to_string_pretty(reports).context("Failed to serialize entity maps")
}

/// Entities grouped under their first line, lowest line first.
pub fn render_text(reports: &[FileReport]) -> String {
    let mut out = String::new();
    for report in reports {
        match report {
            FileReport::Failed { path, error } => {
                let _ = writeln!(out, "{path}: error: {error}");
            }
            FileReport::Mapped { path, entities } => {
                let _ = writeln!(out, "{path}");
                let mut by_line: BTreeMap<u32, Vec<&CodeEntity>> = BTreeMap::new();
                for entity in entities {
                    by_line.entry(entity.first_line).or_default().push(entity);
                }
                for (line, group) in by_line {
                    let _ = writeln!(out, "{line}:");
                    for entity in group {
                        let _ = writeln!(
                            out,
                            "    {}  [{}] {}-{}",
                            entity.display_text(),
                            entity.identity,
                            entity.first_line,
                            entity.last_line
                        );
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::PythonCompiler;
    use crate::extract::RangeExtractor;
    use crate::unit::fixtures::temp_dir;
    use serde_json::Value;

    fn classifier() -> Classifier {
        Classifier::calibrate(&PythonCompiler::new(), RangeExtractor::default(), 1).unwrap()
    }

    #[test]
    fn directories_are_walked_for_python_files() {
        let base = temp_dir("walk");
        std::fs::create_dir_all(base.join("pkg/sub")).unwrap();
        std::fs::write(base.join("pkg/a.py"), "x = 1\n").unwrap();
        std::fs::write(base.join("pkg/sub/b.py"), "y = 2\n").unwrap();
        std::fs::write(base.join("pkg/notes.txt"), "not python").unwrap();
        std::fs::write(base.join("script"), "z = 3\n").unwrap();

        let files = collect_sources(&[base.join("pkg"), base.join("script"), base.join("pkg")]).unwrap();
        assert_eq!(
            files,
            vec![base.join("pkg/a.py"), base.join("pkg/sub/b.py"), base.join("script")]
        );
        assert!(collect_sources(&[base.join("absent")]).is_err());
    }

    #[test]
    fn text_output_groups_by_first_line() {
        let base = temp_dir("text");
        let file = base.join("m.py");
        std::fs::write(&file, "class C:\n    def m(self): pass\n    def n(self, k): pass\n").unwrap();

        let reports = dump(&PythonCompiler::new(), &classifier(), &[file.clone()]);
        let text = render_text(&reports);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], file.display().to_string());
        assert_eq!(lines[1], "1:");
        assert!(lines[2].starts_with("    <module>  ["));
        assert!(lines[3].starts_with("    C  ["));
        assert_eq!(lines[4], "2:");
        assert!(lines[5].starts_with("    C.m(self)  ["));
        assert!(lines[5].ends_with("] 2-2"));
        assert_eq!(lines[6], "3:");
        assert!(lines[7].starts_with("    C.n(self, k)  ["));
    }

    #[test]
    fn json_output_carries_entities_and_errors() {
        let base = temp_dir("json");
        let good = base.join("good.py");
        let bad = base.join("bad.py");
        std::fs::write(&good, "def f(a): pass\n").unwrap();
        std::fs::write(&bad, "def (:\n").unwrap();

        let reports = dump(&PythonCompiler::new(), &classifier(), &[bad.clone(), good.clone()]);
        let json: Value = serde_json::from_str(&render_json(&reports).unwrap()).unwrap();

        assert_eq!(json[0]["path"], bad.display().to_string());
        assert!(json[0]["error"].as_str().unwrap().contains("invalid syntax"));

        let entities = json[1]["entities"].as_array().unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[1]["kind"], "function");
        assert_eq!(entities[1]["name"], "f");
        assert_eq!(entities[1]["args"], "(a)");
        assert_eq!(entities[1]["path"][0]["kind"], "module");
        assert_eq!(entities[1]["identity"].as_str().unwrap().len(), 16);
    }
}
