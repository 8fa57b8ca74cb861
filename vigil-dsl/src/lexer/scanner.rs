//! Lexer implementation

use super::indent::{DEDENT_MARKER, INDENT_MARKER};
use super::token::*;
use std::iter::Peekable;
use std::str::CharIndices;

// ============================================================================
// LEXER IMPLEMENTATION
// ============================================================================

/// Lexer for the (indent-rewritten) Vigil Policy Language.
pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    column: usize,
    pos: usize,
    /// Bracket nesting depth; newlines inside brackets are not tokens.
    depth: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            pos: 0,
            depth: 0,
        }
    }

    /// Tokenize the entire source into a vector of tokens.
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token();
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        tokens
    }

    /// Get the next token from the source.
    fn next_token(&mut self) -> Token {
        loop {
            self.skip_whitespace_and_comments();

            let start_pos = self.pos;
            let start_line = self.line;
            let start_col = self.column;

            let kind = match self.peek_char() {
                None => TokenKind::Eof,
                Some(c) => match c {
                    '\n' => {
                        self.advance();
                        self.line += 1;
                        self.column = 1;
                        if self.depth > 0 {
                            continue;
                        }
                        TokenKind::Newline
                    }
                    '(' => {
                        self.advance();
                        self.depth += 1;
                        TokenKind::LParen
                    }
                    ')' => {
                        self.advance();
                        self.depth = self.depth.saturating_sub(1);
                        TokenKind::RParen
                    }
                    '[' => {
                        self.advance();
                        self.depth += 1;
                        TokenKind::LBracket
                    }
                    ']' => {
                        self.advance();
                        self.depth = self.depth.saturating_sub(1);
                        TokenKind::RBracket
                    }
                    '{' => {
                        self.advance();
                        self.depth += 1;
                        TokenKind::LBrace
                    }
                    '}' => {
                        self.advance();
                        self.depth = self.depth.saturating_sub(1);
                        TokenKind::RBrace
                    }
                    ',' => {
                        self.advance();
                        TokenKind::Comma
                    }
                    '.' => {
                        self.advance();
                        TokenKind::Dot
                    }
                    ':' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Assign
                        } else {
                            TokenKind::Colon
                        }
                    }
                    '=' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Eq
                        } else {
                            TokenKind::Equals
                        }
                    }
                    '!' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Ne
                        } else {
                            TokenKind::Error("Unexpected character: !".to_string())
                        }
                    }
                    '>' => {
                        self.advance();
                        if self.peek_char() == Some('=') {
                            self.advance();
                            TokenKind::Ge
                        } else {
                            TokenKind::Gt
                        }
                    }
                    '<' => self.scan_lt_or_value_type(),
                    '-' => {
                        self.advance();
                        if self.peek_char() == Some('>') {
                            self.advance();
                            TokenKind::FlowsTo
                        } else {
                            TokenKind::Minus
                        }
                    }
                    '~' => {
                        self.advance();
                        if self.peek_char() == Some('>') {
                            self.advance();
                            TokenKind::Successor
                        } else {
                            TokenKind::Error("Unexpected character: ~".to_string())
                        }
                    }
                    '+' => {
                        self.advance();
                        TokenKind::Plus
                    }
                    '*' => {
                        self.advance();
                        if self.peek_char() == Some('*') {
                            self.advance();
                            TokenKind::Power
                        } else {
                            TokenKind::Star
                        }
                    }
                    '/' => {
                        self.advance();
                        TokenKind::Slash
                    }
                    '%' => {
                        self.advance();
                        TokenKind::Percent
                    }
                    '|' => self.scan_layout_marker(),
                    '"' | '\'' => self.scan_string(None),
                    'r' | 'f' if self.is_string_prefix() => {
                        let modifier = c;
                        self.advance();
                        self.scan_string(Some(modifier))
                    }
                    c if c.is_ascii_digit() => self.scan_number(),
                    c if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(),
                    c => {
                        self.advance();
                        TokenKind::Error(format!("Unexpected character: {}", c))
                    }
                },
            };

            return Token {
                kind,
                span: Span {
                    start: start_pos,
                    end: self.pos,
                    line: start_line,
                    column: start_col,
                },
            };
        }
    }

    /// Scan `|INDENT|` / `|DEDENT|` layout markers.
    fn scan_layout_marker(&mut self) -> TokenKind {
        let rest = &self.source[self.pos..];
        if rest.starts_with(INDENT_MARKER) {
            self.advance_n(INDENT_MARKER.len());
            TokenKind::Indent
        } else if rest.starts_with(DEDENT_MARKER) {
            self.advance_n(DEDENT_MARKER.len());
            TokenKind::Dedent
        } else {
            self.advance();
            TokenKind::Error("Unexpected character: |".to_string())
        }
    }

    /// Either a comparison (`<`, `<=`) or a value reference `<NAME>`.
    fn scan_lt_or_value_type(&mut self) -> TokenKind {
        let rest = &self.source[self.pos + 1..];
        let name_len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphabetic() || *c == '_' || *c == ':')
            .count();
        if name_len > 0 && rest[name_len..].starts_with('>') {
            let name = rest[..name_len].to_string();
            self.advance_n(1 + name_len + 1);
            return TokenKind::ValueType(name);
        }

        self.advance();
        if self.peek_char() == Some('=') {
            self.advance();
            TokenKind::Le
        } else {
            TokenKind::Lt
        }
    }

    fn is_string_prefix(&self) -> bool {
        matches!(self.peek_next_char(), Some('"') | Some('\''))
    }

    /// Scan an identifier or keyword.
    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.pos;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }

        let ident = &self.source[start..self.pos];

        match ident {
            "raise" => TokenKind::Raise,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "def" => TokenKind::Def,
            "import" => TokenKind::Import,
            "from" => TokenKind::From,
            "as" => TokenKind::As,
            "for" => TokenKind::For,
            "tool" => TokenKind::Tool,

            "in" => TokenKind::In,
            "is" => TokenKind::Is,
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "contains_only" => TokenKind::ContainsOnly,

            "True" => TokenKind::True,
            "False" => TokenKind::False,
            "None" => TokenKind::NoneLit,

            _ => TokenKind::Identifier(ident.to_string()),
        }
    }

    /// Scan a string literal. Only the quote character itself is
    /// unescaped; other backslash sequences are kept verbatim so string
    /// literals double as regex patterns.
    fn scan_string(&mut self, modifier: Option<char>) -> TokenKind {
        let quote = match self.peek_char() {
            Some(q) => q,
            None => return TokenKind::Error("Unterminated string".to_string()),
        };
        self.advance();

        // triple-quoted multi-line string
        if self.peek_char() == Some(quote) && self.peek_next_char() == Some(quote) {
            self.advance();
            self.advance();
            return self.scan_triple_string(quote, modifier);
        }

        let mut value = String::new();
        loop {
            match self.peek_char() {
                None | Some('\n') => return TokenKind::Error("Unterminated string".to_string()),
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.peek_char() {
                        Some(c) if c == quote => {
                            self.advance();
                            value.push(quote);
                        }
                        Some(c) => {
                            self.advance();
                            value.push('\\');
                            value.push(c);
                        }
                        None => return TokenKind::Error("Unterminated string".to_string()),
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        TokenKind::Str { value, modifier }
    }

    fn scan_triple_string(&mut self, quote: char, modifier: Option<char>) -> TokenKind {
        let mut value = String::new();
        loop {
            match self.peek_char() {
                None => return TokenKind::Error("Unterminated string".to_string()),
                Some(c) if c == quote => {
                    if self.peek_n(1) == Some(quote) && self.peek_n(2) == Some(quote) {
                        self.advance_n(3);
                        break;
                    }
                    self.advance();
                    value.push(c);
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                    value.push('\n');
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }

        TokenKind::Str {
            value: crate::source::dedent(&value),
            modifier,
        }
    }

    /// Scan an integer or float literal.
    fn scan_number(&mut self) -> TokenKind {
        let start = self.pos;
        let mut is_float = false;

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' && !is_float
                && self
                    .peek_next_char()
                    .map(|n| n.is_ascii_digit())
                    .unwrap_or(false)
            {
                is_float = true;
                self.advance();
            } else {
                break;
            }
        }

        let text = &self.source[start..self.pos];
        if is_float {
            match text.parse::<f64>() {
                Ok(n) => TokenKind::Float(n),
                Err(_) => TokenKind::Error(format!("Invalid number: {}", text)),
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => TokenKind::Int(n),
                Err(_) => TokenKind::Error(format!("Invalid number: {}", text)),
            }
        }
    }

    /// Skip spaces, tabs, carriage returns and `#` comments (but not
    /// newlines, which are tokens at bracket depth zero).
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('#') => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next_char(&self) -> Option<char> {
        self.peek_n(1)
    }

    fn peek_n(&self, n: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        if let Some((i, c)) = self.chars.next() {
            self.pos = i + c.len_utf8();
            self.column += 1;
            Some(c)
        } else {
            None
        }
    }

    fn advance_n(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_operators() {
        assert_eq!(
            kinds("a := b -> c ~> d"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Assign,
                TokenKind::Identifier("b".into()),
                TokenKind::FlowsTo,
                TokenKind::Identifier("c".into()),
                TokenKind::Successor,
                TokenKind::Identifier("d".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_value_references_and_comparisons() {
        assert_eq!(
            kinds("<EMAIL_ADDRESS> x <= y"),
            vec![
                TokenKind::ValueType("EMAIL_ADDRESS".into()),
                TokenKind::Identifier("x".into()),
                TokenKind::Le,
                TokenKind::Identifier("y".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_layout_markers() {
        assert_eq!(
            kinds("if |INDENT|\nx |DEDENT|"),
            vec![
                TokenKind::If,
                TokenKind::Indent,
                TokenKind::Newline,
                TokenKind::Identifier("x".into()),
                TokenKind::Dedent,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_not_tokens() {
        let tokens = kinds("foo(\n  1,\n  2\n)");
        assert!(!tokens.contains(&TokenKind::Newline));
    }

    #[test]
    fn string_prefixes_and_escapes() {
        assert_eq!(
            kinds(r#"r"\d+" "say \"hi\"""#),
            vec![
                TokenKind::Str {
                    value: r"\d+".into(),
                    modifier: Some('r'),
                },
                TokenKind::Str {
                    value: "say \"hi\"".into(),
                    modifier: None,
                },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_are_ints_or_floats() {
        assert_eq!(
            kinds("2 2.5"),
            vec![TokenKind::Int(2), TokenKind::Float(2.5), TokenKind::Eof]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("x # trailing note\ny"),
            vec![
                TokenKind::Identifier("x".into()),
                TokenKind::Newline,
                TokenKind::Identifier("y".into()),
                TokenKind::Eof,
            ]
        );
    }
}
