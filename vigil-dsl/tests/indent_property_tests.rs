//! Property tests for the indent rewriter

use proptest::prelude::*;
use vigil_dsl::{rewrite_indentation, DEDENT_MARKER, INDENT_MARKER};

/// Simple nested-block sources: a rule header followed by body lines at
/// varying (valid) depths.
fn block_source() -> impl Strategy<Value = String> {
    prop::collection::vec((0usize..3, "[a-z]{1,6}"), 1..8).prop_map(|lines| {
        let mut out = String::from("raise \"x\" if:\n");
        let mut depth = 1usize;
        for (step, word) in lines {
            // depth may only grow by opening another block
            depth = match step {
                0 => depth,
                1 => depth.saturating_sub(1).max(1),
                _ => depth,
            };
            out.push_str(&"    ".repeat(depth));
            out.push_str(&word);
            out.push('\n');
        }
        out
    })
}

proptest! {
    #[test]
    fn markers_are_balanced(source in block_source()) {
        let (rewritten, _) = rewrite_indentation(&source);
        let indents = rewritten.matches(INDENT_MARKER).count();
        let dedents = rewritten.matches(DEDENT_MARKER).count();
        prop_assert_eq!(indents, dedents);
    }

    #[test]
    fn rewriting_never_drops_content_words(source in block_source()) {
        let (rewritten, _) = rewrite_indentation(&source);
        for line in source.lines() {
            let word = line.trim().trim_end_matches(':');
            if !word.is_empty() {
                prop_assert!(rewritten.contains(word));
            }
        }
    }

    #[test]
    fn line_map_is_monotone(source in block_source()) {
        let (rewritten, map) = rewrite_indentation(&source);
        let lines = rewritten.split('\n').count();
        let mut last = 0;
        for i in 1..=lines {
            let original = map.original_line(i);
            prop_assert!(original >= last);
            last = original;
        }
    }
}
