//! Recursive-descent parser for the Vigil Policy Language.
//!
//! Operates on the indent-rewritten token stream; `Indent`/`Dedent` play
//! the role braces play in brace languages. Expression precedence, loosest
//! to tightest: `:=`, ternary, `or`, `and`, `not`, comparisons (`==` `!=`
//! `<` `>` `<=` `>=` `is` `in` `contains_only` `->` `~>`), `+`/`-`,
//! `*`/`/`/`%`, `**`, unary, postfix (call, member, key access).

use super::ast::*;
use crate::lexer::{Token, TokenKind};
use thiserror::Error;

// ============================================================================
// PARSE ERROR
// ============================================================================

/// Parse error with line/column information.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Parse error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

// ============================================================================
// PARSER
// ============================================================================

/// Parser for the Vigil Policy Language.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    /// Create a new parser from a vector of tokens.
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse the tokens into a policy AST.
    pub fn parse(&mut self) -> Result<PolicyAst, ParseError> {
        let mut statements = Vec::new();

        loop {
            self.skip_newlines();
            if self.is_at_end() {
                break;
            }
            statements.push(self.parse_statement()?);
        }

        Ok(PolicyAst { statements })
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        match &self.current().kind {
            TokenKind::Raise => self.parse_raise().map(Stmt::Raise),
            TokenKind::Import | TokenKind::From => self.parse_import().map(Stmt::Import),
            TokenKind::Def => self.parse_def().map(Stmt::Declaration),
            TokenKind::Identifier(_) => self.parse_declaration().map(Stmt::Declaration),
            _ => Err(self.error("Expected statement (raise, def, declaration or import)")),
        }
    }

    /// `raise <string | identifier | call> if: <body>`
    fn parse_raise(&mut self) -> Result<RaiseRule, ParseError> {
        let loc = self.loc();
        self.expect(TokenKind::Raise)?;

        let constructor = match self.current().kind.clone() {
            TokenKind::Str { value, modifier } => {
                let loc = self.loc();
                self.advance();
                Expr::new(ExprKind::Str { value, modifier }, loc)
            }
            TokenKind::Identifier(_) => {
                let ident = self.parse_atom()?;
                self.parse_postfix_chain(ident)?
            }
            _ => return Err(self.error("Expected error message or constructor after 'raise'")),
        };

        self.expect(TokenKind::If)?;
        let body = self.parse_indented_body()?;

        Ok(RaiseRule {
            constructor,
            body,
            loc,
        })
    }

    /// `import a.b as c` / `from a.b import x, y as z`
    fn parse_import(&mut self) -> Result<ImportStmt, ParseError> {
        let loc = self.loc();

        if self.check(&TokenKind::Import) {
            self.advance();
            let module = self.parse_module_path()?;
            let alias = if self.check(&TokenKind::As) {
                self.advance();
                Some(self.expect_identifier()?)
            } else {
                None
            };
            return Ok(ImportStmt {
                module,
                names: Vec::new(),
                alias,
                loc,
            });
        }

        self.expect(TokenKind::From)?;
        let module = self.parse_module_path()?;
        self.expect(TokenKind::Import)?;

        let mut names = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let alias = if self.check(&TokenKind::As) {
                self.advance();
                Some(self.expect_identifier()?)
            } else {
                None
            };
            names.push(ImportSpec { name, alias });
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }

        Ok(ImportStmt {
            module,
            names,
            alias: None,
            loc,
        })
    }

    fn parse_module_path(&mut self) -> Result<String, ParseError> {
        let mut module = self.expect_identifier()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            module.push('.');
            module.push_str(&self.expect_identifier()?);
        }
        Ok(module)
    }

    /// `def name(a: T): <body>` - predicate definition.
    fn parse_def(&mut self) -> Result<Declaration, ParseError> {
        let loc = self.loc();
        self.expect(TokenKind::Def)?;
        let name = self.expect_identifier()?;
        let params = self.parse_params()?;
        let body = self.parse_indented_body()?;
        Ok(Declaration {
            signature: DeclSignature::Predicate { name, params },
            body,
            loc,
        })
    }

    /// `NAME := expr`, `name(a: T) := expr` or their indented-block forms.
    fn parse_declaration(&mut self) -> Result<Declaration, ParseError> {
        let loc = self.loc();
        let name = self.expect_identifier()?;

        let signature = if self.check(&TokenKind::LParen) {
            DeclSignature::Predicate {
                name,
                params: self.parse_params()?,
            }
        } else {
            DeclSignature::Constant(name)
        };

        let body = if self.check(&TokenKind::Assign) {
            self.advance();
            vec![self.parse_expr()?]
        } else if self.check(&TokenKind::Indent) {
            self.parse_indented_body()?
        } else {
            return Err(self.error("Expected ':=' or an indented block in declaration"));
        };

        Ok(Declaration {
            signature,
            body,
            loc,
        })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let loc = self.loc();
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Colon)?;
            let type_ref = self.expect_identifier()?;
            params.push(Param {
                name,
                type_ref,
                loc,
                decl: None,
            });
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    /// An `INDENT expr (NEWLINE expr)* DEDENT` block.
    fn parse_indented_body(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(TokenKind::Indent)?;
        let mut body = Vec::new();

        loop {
            self.skip_newlines();
            if self.check(&TokenKind::Dedent) {
                self.advance();
                break;
            }
            if self.is_at_end() {
                return Err(self.error("Unexpected end of input inside indented block"));
            }
            body.push(self.parse_body_expr()?);
            if !self.check(&TokenKind::Newline)
                && !self.check(&TokenKind::Dedent)
                && !self.is_at_end()
            {
                return Err(self.error("Expected end of expression"));
            }
        }

        if body.is_empty() {
            return Err(self.error("Indented block must contain at least one expression"));
        }
        Ok(body)
    }

    /// A body line; an expression followed by an indented block is a
    /// quantifier (`forall:`, `count(min=2):`, optionally negated).
    fn parse_body_expr(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if self.check(&TokenKind::Indent) {
            let body = self.parse_indented_body()?;
            let loc = expr.loc;
            let (call, negated) = match expr.kind {
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: inner,
                } => (inner, true),
                other => (Box::new(Expr::new(other, loc)), false),
            };
            return Ok(Expr::new(
                ExprKind::Quantifier {
                    call,
                    negated,
                    body,
                },
                loc,
            ));
        }
        Ok(expr)
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_ternary()?;
        if self.check(&TokenKind::Assign) {
            let loc = left.loc;
            self.advance();
            let right = self.parse_ternary()?;
            return Ok(Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Assign,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            ));
        }
        Ok(left)
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let then = self.parse_or()?;
        if self.check(&TokenKind::If) {
            let loc = then.loc;
            self.advance();
            let cond = self.parse_or()?;
            self.expect(TokenKind::Else)?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::new(
                ExprKind::Ternary {
                    then: Box::new(then),
                    cond: Box::new(cond),
                    otherwise: Box::new(otherwise),
                },
                loc,
            ));
        }
        Ok(then)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::Or) {
            let loc = left.loc;
            self.advance();
            let right = self.parse_and()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.check(&TokenKind::And) {
            let loc = left.loc;
            self.advance();
            let right = self.parse_not()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.check(&TokenKind::Not) {
            let loc = self.loc();
            self.advance();
            let expr = self.parse_not()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    expr: Box::new(expr),
                },
                loc,
            ));
        }
        self.parse_comparison()
    }

    fn comparison_op(&self) -> Option<BinaryOp> {
        match self.current().kind {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Le => Some(BinaryOp::Le),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::Is => Some(BinaryOp::Is),
            TokenKind::In => Some(BinaryOp::In),
            TokenKind::ContainsOnly => Some(BinaryOp::ContainsOnly),
            TokenKind::FlowsTo => Some(BinaryOp::FlowsTo),
            TokenKind::Successor => Some(BinaryOp::Successor),
            _ => None,
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        while let Some(op) = self.comparison_op() {
            let loc = left.loc;
            self.advance();
            let right = self.parse_term()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let loc = left.loc;
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.current().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let loc = left.loc;
            self.advance();
            let right = self.parse_power()?;
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        while self.check(&TokenKind::Power) {
            let loc = left.loc;
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::new(
                ExprKind::Binary {
                    op: BinaryOp::Pow,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                loc,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.current().kind {
            TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            let loc = self.loc();
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    expr: Box::new(expr),
                },
                loc,
            ));
        }

        let atom = self.parse_atom()?;
        self.parse_postfix_chain(atom)
    }

    /// Member access, key access and calls, applied greedily.
    fn parse_postfix_chain(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.current().kind {
                TokenKind::Dot => {
                    let loc = expr.loc;
                    self.advance();
                    let member = self.expect_identifier()?;
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            member,
                        },
                        loc,
                    );
                }
                TokenKind::LBracket => {
                    let loc = expr.loc;
                    self.advance();
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Key {
                            object: Box::new(expr),
                            key: Box::new(key),
                        },
                        loc,
                    );
                }
                TokenKind::LParen => {
                    let loc = expr.loc;
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                            kwargs,
                        },
                        loc,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    #[allow(clippy::type_complexity)]
    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        while !self.check(&TokenKind::RParen) {
            let is_kwarg = matches!(self.current().kind, TokenKind::Identifier(_))
                && matches!(self.peek_kind(1), Some(TokenKind::Equals));
            if is_kwarg {
                let name = self.expect_identifier()?;
                self.expect(TokenKind::Equals)?;
                let value = self.parse_expr()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("Positional argument after keyword argument"));
                }
                args.push(self.parse_expr()?);
            }
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }

        self.expect(TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        match self.current().kind.clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(n), loc))
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(n), loc))
            }
            TokenKind::Str { value, modifier } => {
                self.advance();
                Ok(Expr::new(ExprKind::Str { value, modifier }, loc))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(true), loc))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::new(ExprKind::Bool(false), loc))
            }
            TokenKind::NoneLit => {
                self.advance();
                Ok(Expr::new(ExprKind::NoneLit, loc))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident { name, decl: None }, loc))
            }
            TokenKind::Tool => {
                self.advance();
                self.expect(TokenKind::Colon)?;
                let name = self.expect_identifier()?;
                Ok(Expr::new(ExprKind::ToolRef { name }, loc))
            }
            TokenKind::ValueType(value_type) => {
                self.advance();
                Ok(Expr::new(ExprKind::ValueRef { value_type }, loc))
            }
            TokenKind::Star => {
                self.advance();
                Ok(Expr::new(ExprKind::Wildcard, loc))
            }
            TokenKind::LParen => self.parse_paren(),
            TokenKind::LBrace => self.parse_object_literal(),
            TokenKind::LBracket => self.parse_list_or_comprehension(),
            _ => Err(self.error("Expected expression")),
        }
    }

    /// Either a typed identifier `(name: Type)` or a parenthesized
    /// expression.
    fn parse_paren(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();

        let is_typed_ident = matches!(self.peek_kind(1), Some(TokenKind::Identifier(_)))
            && matches!(self.peek_kind(2), Some(TokenKind::Colon))
            && matches!(self.peek_kind(3), Some(TokenKind::Identifier(_)))
            && matches!(self.peek_kind(4), Some(TokenKind::RParen));

        if is_typed_ident {
            self.expect(TokenKind::LParen)?;
            let name = self.expect_identifier()?;
            self.expect(TokenKind::Colon)?;
            let type_ref = self.expect_identifier()?;
            self.expect(TokenKind::RParen)?;
            return Ok(Expr::new(
                ExprKind::TypedIdent {
                    name,
                    type_ref,
                    decl: None,
                },
                loc,
            ));
        }

        self.expect(TokenKind::LParen)?;
        let expr = self.parse_expr()?;
        self.expect(TokenKind::RParen)?;
        Ok(expr)
    }

    fn parse_object_literal(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        self.expect(TokenKind::LBrace)?;
        let mut entries = Vec::new();

        while !self.check(&TokenKind::RBrace) {
            let key = match self.current().kind.clone() {
                TokenKind::Identifier(name) => {
                    self.advance();
                    name
                }
                TokenKind::Str { value, .. } => {
                    self.advance();
                    value
                }
                _ => return Err(self.error("Expected object key (identifier or string)")),
            };
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expr()?;
            entries.push((key, value));
            if self.check(&TokenKind::Comma) {
                self.advance();
            }
        }

        self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::ObjectLit { entries }, loc))
    }

    /// `[a, b, c]` or `[e for v in it if c]`.
    fn parse_list_or_comprehension(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        self.expect(TokenKind::LBracket)?;

        if self.check(&TokenKind::RBracket) {
            self.advance();
            return Ok(Expr::new(ExprKind::ListLit { items: Vec::new() }, loc));
        }

        let first = self.parse_expr()?;

        if self.check(&TokenKind::For) {
            self.advance();
            let var = self.expect_identifier()?;
            self.expect(TokenKind::In)?;
            let iterable = self.parse_expr()?;
            let condition = if self.check(&TokenKind::If) {
                self.advance();
                Some(Box::new(self.parse_expr()?))
            } else {
                None
            };
            self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListComprehension {
                    expr: Box::new(first),
                    var,
                    var_decl: None,
                    iterable: Box::new(iterable),
                    condition,
                },
                loc,
            ));
        }

        let mut items = vec![first];
        while self.check(&TokenKind::Comma) {
            self.advance();
            if self.check(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::ListLit { items }, loc))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn loc(&self) -> Loc {
        let span = self.current().span;
        Loc {
            line: span.line,
            column: span.column,
        }
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn is_at_end(&self) -> bool {
        self.current().kind == TokenKind::Eof
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.check(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!(
                "Expected {:?}, found {:?}",
                kind,
                self.current().kind
            )))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.current().kind.clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(&format!("Expected identifier, found {:?}", other))),
        }
    }

    fn error(&self, message: &str) -> ParseError {
        let span = self.current().span;
        ParseError {
            message: message.to_string(),
            line: span.line,
            column: span.column,
        }
    }
}
