//! Indentation rewriter.
//!
//! Translates the indentation-sensitive surface syntax into a form a
//! context-free grammar can handle: when the indentation deepens after a
//! line ending in `:` or `:=`, that trailing punctuation is replaced with
//! `|INDENT|` markers; when it shallows, `|DEDENT|` markers are appended to
//! the previous line, one per closed level. The markers play the role `{`
//! and `}` play in brace languages.
//!
//! Blank lines are dropped. A `LineMap` records, per rewritten line, the
//! original line number so spans survive into AST locations.

pub const INDENT_MARKER: &str = "|INDENT|";
pub const DEDENT_MARKER: &str = "|DEDENT|";

/// Maps 1-based rewritten line numbers back to 1-based original lines.
#[derive(Debug, Clone, Default)]
pub struct LineMap {
    lines: Vec<usize>,
}

impl LineMap {
    pub fn original_line(&self, rewritten_line: usize) -> usize {
        self.lines
            .get(rewritten_line.saturating_sub(1))
            .copied()
            .unwrap_or(rewritten_line)
    }
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// The indentation unit is the smallest non-zero indent in the file.
fn indent_unit(text: &str) -> usize {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(indent_width)
        .filter(|w| *w > 0)
        .min()
        .unwrap_or(1)
}

/// Rewrites indented blocks into marker form. Returns the rewritten source
/// and the line mapping back to the original coordinates.
pub fn rewrite_indentation(text: &str) -> (String, LineMap) {
    let unit = indent_unit(text);
    let mut out: Vec<String> = Vec::new();
    let mut map = LineMap::default();
    let mut indent = 0usize;

    for (i, line) in text.split('\n').enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let level = indent_width(line) / unit;

        if level > indent {
            if let Some(prev) = out.last_mut() {
                let trimmed = prev.trim_end();
                if trimmed.ends_with(":=") {
                    let cut = trimmed.len() - 2;
                    *prev = format!("{}{}", &trimmed[..cut], format_markers(level - indent));
                    indent = level;
                } else if trimmed.ends_with(':') {
                    let cut = trimmed.len() - 1;
                    *prev = format!("{}{}", &trimmed[..cut], format_markers(level - indent));
                    indent = level;
                }
            }
            // deeper continuation lines without a block opener keep the
            // current level
        }

        while level < indent {
            if let Some(prev) = out.last_mut() {
                prev.push(' ');
                prev.push_str(DEDENT_MARKER);
            }
            indent -= 1;
        }

        out.push(line.to_string());
        map.lines.push(i + 1);
    }

    while indent > 0 {
        if let Some(prev) = out.last_mut() {
            prev.push(' ');
            prev.push_str(DEDENT_MARKER);
        }
        indent -= 1;
    }

    (out.join("\n"), map)
}

fn format_markers(levels: usize) -> String {
    let mut s = String::new();
    for _ in 0..levels {
        s.push(' ');
        s.push_str(INDENT_MARKER);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_closes_blocks() {
        let src = "raise \"x\" if:\n    (m: Message)\n    m.role == \"user\"\n";
        let (rewritten, _) = rewrite_indentation(src);
        assert_eq!(
            rewritten,
            "raise \"x\" if |INDENT|\n    (m: Message)\n    m.role == \"user\" |DEDENT|"
        );
    }

    #[test]
    fn assignment_blocks_drop_the_walrus() {
        let src = "is_admin(m: Message) :=\n    m.role == \"admin\"\nx := 1\n";
        let (rewritten, _) = rewrite_indentation(src);
        assert!(rewritten.starts_with("is_admin(m: Message) |INDENT|"));
        assert!(rewritten.contains("|DEDENT|\nx := 1"));
    }

    #[test]
    fn nested_blocks_dedent_in_order() {
        let src = "raise \"x\" if:\n  forall:\n    (m: Message)\n";
        let (rewritten, _) = rewrite_indentation(src);
        assert_eq!(
            rewritten,
            "raise \"x\" if |INDENT|\n  forall |INDENT|\n    (m: Message) |DEDENT| |DEDENT|"
        );
    }

    #[test]
    fn line_map_skips_blank_lines() {
        let src = "\n\nraise \"x\" if:\n\n    (m: Message)\n";
        let (_, map) = rewrite_indentation(src);
        assert_eq!(map.original_line(1), 3);
        assert_eq!(map.original_line(2), 5);
    }

    #[test]
    fn mixed_indent_units_use_the_minimum() {
        let src = "raise \"x\" if:\n    (m: Message)\n";
        let (rewritten, _) = rewrite_indentation(src);
        // a single four-space level is one block level, not four
        assert_eq!(rewritten.matches(INDENT_MARKER).count(), 1);
    }
}
