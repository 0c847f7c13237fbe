//! Include-file discovery.
//!
//! The contract is thin: given the primary source files, produce the full
//! ordered sequence of source buffers with stable module names. `include
//! NAME;` directives are discovered textually (they are resolved before
//! parsing), searched on disk, deduplicated by logical name, and ordered
//! includes-first in depth-first discovery order with the primary files last.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

/// A source buffer with its logical module name.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub module_name: String,
    pub is_primary: bool,
    pub source: String,
}

/// Load the primary files and everything they transitively include.
pub fn collect_sources(inputs: &[PathBuf]) -> io::Result<Vec<SourceFile>> {
    let mut primaries = Vec::new();
    let mut loaded: HashSet<String> = HashSet::new();

    for input in inputs {
        let source = std::fs::read_to_string(input)?;
        loaded.insert(module_name(input));
        primaries.push(SourceFile {
            path: input.clone(),
            module_name: module_name(input),
            is_primary: true,
            source,
        });
    }

    let mut includes = Vec::new();
    for primary in &primaries {
        let current_dir = parent_dir(&primary.path);
        for name in scan_includes(&primary.source) {
            load_include(&name, &current_dir, &mut includes, &mut loaded);
        }
    }

    includes.extend(primaries);
    Ok(includes)
}

fn load_include(
    name: &str,
    current_dir: &Path,
    out: &mut Vec<SourceFile>,
    loaded: &mut HashSet<String>,
) {
    if loaded.contains(name) {
        return;
    }
    loaded.insert(name.to_string());

    let Some(path) = find_include_file(name, current_dir) else {
        eprintln!("Warning: could not find include: {}", name);
        return;
    };

    let source = match std::fs::read_to_string(&path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Warning: could not read include '{}': {}", path.display(), err);
            return;
        }
    };

    let nested: Vec<String> = scan_includes(&source);
    out.push(SourceFile {
        module_name: name.to_string(),
        path: path.clone(),
        is_primary: false,
        source,
    });

    let next_dir = parent_dir(&path);
    for nested_name in nested {
        load_include(&nested_name, &next_dir, out, loaded);
    }
}

/// Search order: current working directory, the including file's directory,
/// a sibling `../include/`, then `./include/`.
fn find_include_file(name: &str, current_dir: &Path) -> Option<PathBuf> {
    let file_name = format!("{}.tail", name);
    let candidates = [
        PathBuf::from(&file_name),
        current_dir.join(&file_name),
        PathBuf::from("../include").join(&file_name),
        PathBuf::from("./include").join(&file_name),
    ];

    candidates.into_iter().find(|p| p.exists())
}

/// Textual scan for `include NAME;` lines.
fn scan_includes(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("include ") else {
            continue;
        };
        let Some(end) = rest.find(';') else {
            continue;
        };
        let name: String = rest[..end].chars().filter(|c| !c.is_whitespace()).collect();
        if !name.is_empty() {
            names.push(name);
        }
    }
    names
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_dir(path: &Path) -> PathBuf {
    let dir = path.parent().unwrap_or(Path::new("."));
    if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_includes() {
        let source = "include math;\nfn Main(){ }\n  include strings ;\n// include nope;\n";
        assert_eq!(scan_includes(source), vec!["math", "strings"]);
    }

    #[test]
    fn test_scan_ignores_unterminated_directive() {
        assert_eq!(scan_includes("include broken\n"), Vec::<String>::new());
    }

    #[test]
    fn test_module_name_strips_extension() {
        assert_eq!(module_name(Path::new("dir/prog.tail")), "prog");
        assert_eq!(module_name(Path::new("prog.tail")), "prog");
    }
}
