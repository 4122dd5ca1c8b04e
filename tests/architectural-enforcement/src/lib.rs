//! Architectural Enforcement - Source Scanners for the Resilience Crates
//!
//! Line-based scanners used by the tests in `tests/` to keep the runtime
//! paths of `resilience-core` and `resilience-daemon` free of ad-hoc sleeps
//! and blocking I/O. Everything after the first `#[cfg(test)]` line of a
//! file is treated as test code and ignored.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Source directories holding production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["resilience/core/src", "resilience/daemon/src"];

/// Workspace root, resolved from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// A production source file, truncated at its test module
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Parse `content`, keeping only the lines before `#[cfg(test)]`
    #[must_use]
    pub fn from_content(path: impl Into<PathBuf>, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(str::to_string)
            .collect();
        Self {
            path: path.into(),
            lines,
        }
    }

    #[must_use]
    pub fn line_refs(&self) -> Vec<&str> {
        self.lines.iter().map(String::as_str).collect()
    }
}

/// A rule violation at a specific line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line_number: usize,
    pub kind: &'static str,
    pub line: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line_number,
            self.kind,
            self.line.trim()
        )
    }
}

/// Every `.rs` file under the production directories
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut sources = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(entry.path()) {
                sources.push(SourceFile::from_content(entry.path(), &content));
            }
        }
    }

    sources
}

/// The code portion of a line, with any trailing `//` comment removed
#[must_use]
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

// =============================================================================
// Sleep
// =============================================================================

/// Sleep calls outside a retry/backoff delay or an interval loop
#[must_use]
pub fn find_sleep_violations(source: &SourceFile) -> Vec<Violation> {
    let lines = source.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);
        if !(code.contains("::sleep(") || code.contains(".sleep(")) {
            continue;
        }
        if is_backoff_context(&lines, idx) || is_interval_pattern(&lines, idx) {
            continue;
        }
        violations.push(Violation {
            path: source.path.clone(),
            line_number: idx + 1,
            kind: "Sleep in production code",
            line: (*line).to_string(),
        });
    }

    violations
}

/// A sleep on a computed delay inside retry or fallback logic
#[must_use]
pub fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let Some(current) = lines.get(current_idx) else {
        return false;
    };
    if !current.to_lowercase().contains("delay") {
        return false;
    }

    let start = current_idx.saturating_sub(15);
    let end = (current_idx + 5).min(lines.len());
    lines[start..end].iter().any(|line| {
        let line = line.to_lowercase();
        line.contains("retry") || line.contains("backoff") || line.contains("attempt")
    })
}

/// Periodic work driven by `tokio::time::interval`
#[must_use]
pub fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let start = current_idx.saturating_sub(20);
    let end = (current_idx + 5).min(lines.len());
    lines[start..end]
        .iter()
        .any(|line| line.contains("interval.tick()") || line.contains("tokio::time::interval"))
}

// =============================================================================
// Blocking I/O
// =============================================================================

/// Blocking file, network, process or HTTP calls inside async code
#[must_use]
pub fn find_blocking_io_violations(source: &SourceFile) -> Vec<Violation> {
    let lines = source.line_refs();
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let code = code_part(line);

        let kind = if code.contains("std::fs::") || code.contains("use std::fs") {
            "Blocking file I/O"
        } else if code.contains("std::net::") || code.contains("use std::net") {
            "Blocking network I/O"
        } else if code.contains("std::process::Command") {
            "Blocking process I/O"
        } else if code.contains("reqwest::blocking") {
            "Blocking HTTP client"
        } else {
            continue;
        };

        if is_in_non_async_function(&lines, idx) {
            continue;
        }

        violations.push(Violation {
            path: source.path.clone(),
            line_number: idx + 1,
            kind,
            line: (*line).to_string(),
        });
    }

    violations
}

fn is_fn_signature(line: &str) -> bool {
    line.starts_with("fn ") || line.contains(" fn ")
}

/// Whether the nearest enclosing function signature is not `async`
///
/// Module-level lines (`use` statements) count as async context.
#[must_use]
pub fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    for line in lines[..current_idx.min(lines.len())].iter().rev() {
        let line = line.trim();

        if line.contains("async fn ") {
            return false;
        }
        if is_fn_signature(line) {
            return true;
        }
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_truncated_at_test_module() {
        let source = SourceFile::from_content(
            "x.rs",
            "fn a() {}\n\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n",
        );
        assert_eq!(source.lines, vec!["fn a() {}", ""]);
    }

    #[test]
    fn test_backoff_sleep_allowed() {
        let lines = [
            "async fn execute(&self) {",
            "    let delay = self.next_delay(attempt);",
            "    // Backoff before the next retry attempt",
            "    tokio::time::sleep(delay).await;",
            "}",
        ];
        assert!(is_backoff_context(&lines, 3));
    }

    #[test]
    fn test_polling_sleep_flagged() {
        let content = "async fn wait_ready(&self) {\n    loop {\n        if self.ready() { break; }\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n";
        let source = SourceFile::from_content("poll.rs", content);

        let violations = find_sleep_violations(&source);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line_number, 4);
    }

    #[test]
    fn test_interval_loop_allowed() {
        let lines = [
            "let mut ticker = tokio::time::interval(period);",
            "loop {",
            "    ticker.tick().await;",
            "    tokio::time::sleep(jitter).await;",
            "}",
        ];
        assert!(is_interval_pattern(&lines, 3));
    }

    #[test]
    fn test_blocking_read_in_async_fn_flagged() {
        let content = "async fn load() {\n    let text = std::fs::read_to_string(\"a.toml\");\n}\n";
        let source = SourceFile::from_content("load.rs", content);

        let violations = find_blocking_io_violations(&source);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, "Blocking file I/O");
    }

    #[test]
    fn test_blocking_read_in_sync_fn_allowed() {
        let lines = [
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<Config, Error> {",
            "    let text = std::fs::read_to_string(path)?;",
            "}",
        ];
        assert!(is_in_non_async_function(&lines, 1));
    }

    #[test]
    fn test_module_level_import_flagged() {
        let source = SourceFile::from_content("net.rs", "use std::net::TcpStream;\n");
        let violations = find_blocking_io_violations(&source);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, "Blocking network I/O");
    }
}
