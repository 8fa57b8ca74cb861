//! Vigil DSL - Policy Language Front End
//!
//! This crate turns Vigil Policy Language source into a resolved AST:
//!
//! ```text
//! Policy source (.vgl)
//!     ↓
//! Indent rewriter (INDENT/DEDENT markers)
//!     ↓
//! Lexer (tokenize)
//!     ↓
//! Parser (build AST)
//!     ↓
//! Scope resolution + validation
//! ```
//!
//! The language is indentation-sensitive; the rewriter turns indented
//! blocks into explicit markers so the grammar itself stays context-free.

pub mod lexer;
pub mod parser;
pub mod scope;
pub mod source;

// Re-export key types for convenience
pub use lexer::*;
pub use parser::*;
pub use scope::*;
pub use source::*;

/// A fully front-ended policy: AST, resolved scopes, source handle and any
/// issues found along the way. A policy with a non-empty issue list must be
/// rejected by the caller.
#[derive(Debug, Clone)]
pub struct ParsedPolicy {
    pub ast: parser::PolicyAst,
    pub scopes: scope::ScopeTable,
    pub issues: Vec<scope::PolicyIssue>,
    pub source: source::SourceCode,
}

/// Parses and resolves a policy. `value_types` names the value references
/// (`<EMAIL_ADDRESS>`, ...) the caller's detector registry supports.
pub fn parse(text: &str, path: Option<&str>, value_types: &[&str]) -> ParsedPolicy {
    let dedented = source::dedent(text);
    let source_code = source::SourceCode::new(&dedented, path);
    let (rewritten, line_map) = lexer::rewrite_indentation(&dedented);

    let mut tokens = lexer::Lexer::new(&rewritten).tokenize();
    for token in &mut tokens {
        token.span.line = line_map.original_line(token.span.line);
    }

    match parser::Parser::new(tokens).parse() {
        Ok(mut ast) => {
            parser::rewrite_tool_call_patterns(&mut ast);
            let (scopes, issues) = scope::resolve(&mut ast, value_types);
            ParsedPolicy {
                ast,
                scopes,
                issues,
                source: source_code,
            }
        }
        Err(err) => ParsedPolicy {
            ast: parser::PolicyAst::default(),
            scopes: scope::ScopeTable::default(),
            issues: vec![scope::PolicyIssue {
                message: err.message,
                line: err.line,
                column: err.column,
                path: path.map(|p| p.to_string()),
            }],
            source: source_code,
        },
    }
}
