//! Source handles and error-window rendering.

use std::fmt::Write as _;

/// Removes the common leading indentation of all non-blank lines, so that
/// policies embedded in indented host strings parse cleanly.
pub fn dedent(text: &str) -> String {
    let common = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    if common == 0 {
        return text.to_string();
    }
    text.lines()
        .map(|line| if line.len() >= common { &line[common..] } else { line.trim_start() })
        .collect::<Vec<_>>()
        .join("\n")
}

/// A handle on the policy source used for error localization.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCode {
    pub path: Option<String>,
    pub code: String,
}

impl SourceCode {
    pub fn new(code: &str, path: Option<&str>) -> Self {
        Self {
            path: path.map(|p| p.to_string()),
            code: code.to_string(),
        }
    }

    /// Renders a caret-annotated window of `window` lines around the given
    /// 1-based error line.
    pub fn error_window(&self, message: &str, line: usize, column: usize, window: usize) -> String {
        let lines: Vec<&str> = self.code.split('\n').collect();
        let error_idx = line.saturating_sub(1);
        let lo = error_idx.saturating_sub(window);
        let hi = (error_idx + window + 1).min(lines.len());

        let mut out = String::new();
        if let Some(path) = &self.path {
            let _ = writeln!(out, "File {}:{}", path, line);
        }
        for i in lo..hi {
            if i == error_idx {
                let _ = writeln!(out, "{:3}* | {}", i + 1, lines[i]);
                let _ = writeln!(out, "     | {}^", " ".repeat(column.saturating_sub(1)));
                let _ = writeln!(out, "     | {}", message);
            } else {
                let _ = writeln!(out, "{:3}  | {}", i + 1, lines[i]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedent_strips_common_indent() {
        let text = "\n    raise \"x\" if:\n        (m: Message)\n";
        let out = dedent(text);
        assert!(out.contains("\nraise \"x\" if:"));
        assert!(out.contains("\n    (m: Message)"));
    }

    #[test]
    fn error_window_marks_the_line() {
        let source = SourceCode::new("a\nb\nc\nd", Some("p.vgl"));
        let window = source.error_window("boom", 2, 1, 1);
        assert!(window.contains("  2* | b"));
        assert!(window.contains("boom"));
    }
}
