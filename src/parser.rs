// File: src/parser.rs
//
// Recursive-descent parser turning a token stream into the AST node shapes
// required by spec §6. Like the lexer, this sits outside the specified
// core (spec §1) but is fully implemented so scripts actually run.

use crate::ast::*;
use crate::errors::{PyleError, SourceLocation};
use crate::lexer::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
}

type PResult<T> = Result<T, PyleError>;

impl Parser {
    pub fn new(tokens: Vec<Token>, file: &str) -> Self {
        Self { tokens, pos: 0, file: file.to_string() }
    }

    pub fn parse_program(&mut self) -> PResult<Vec<StmtNode>> {
        let mut stmts = Vec::new();
        while !self.is_eof() {
            stmts.push(self.parse_stmt()?);
        }
        Ok(stmts)
    }

    // --- token stream helpers -------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn is_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn token_here(&self) -> crate::ast::Token {
        let t = self.peek();
        crate::ast::Token::new(self.file.clone(), t.line, t.col, t.col)
    }

    fn location_here(&self) -> SourceLocation {
        let t = self.peek();
        SourceLocation::with_file(t.line, t.col, self.file.clone())
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(PyleError::syntactic(
                format!("expected {}, found {:?}", what, self.peek_kind()),
                self.location_here(),
            ))
        }
    }

    fn eat_semicolon(&mut self) {
        if self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        if let TokenKind::Identifier(name) = self.peek_kind().clone() {
            self.advance();
            Ok(name)
        } else {
            Err(PyleError::syntactic(
                format!("expected identifier, found {:?}", self.peek_kind()),
                self.location_here(),
            ))
        }
    }

    // --- statements -------------------------------------------------------

    fn parse_block(&mut self) -> PResult<Vec<StmtNode>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.is_eof() {
            stmts.push(self.parse_stmt()?);
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<StmtNode> {
        let tok = self.token_here();
        match self.peek_kind().clone() {
            TokenKind::Let | TokenKind::Const => self.parse_var_decl(tok),
            TokenKind::Fn => self.parse_fn_decl(tok),
            TokenKind::If => self.parse_if(tok),
            TokenKind::While => self.parse_while(tok),
            TokenKind::For => self.parse_for(tok),
            TokenKind::Return => self.parse_return(tok),
            TokenKind::Break => {
                self.advance();
                self.eat_semicolon();
                Ok(StmtNode::new(Stmt::Break, tok))
            }
            TokenKind::Continue => {
                self.advance();
                self.eat_semicolon();
                Ok(StmtNode::new(Stmt::Continue, tok))
            }
            TokenKind::Use => self.parse_use(tok),
            TokenKind::LBrace => {
                let body = self.parse_block()?;
                Ok(StmtNode::new(Stmt::Block(body), tok))
            }
            _ => self.parse_assign_or_expr_stmt(tok),
        }
    }

    fn parse_var_decl(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        let is_const = matches!(self.peek_kind(), TokenKind::Const);
        self.advance();

        let mut names = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            names.push(self.expect_identifier()?);
        }

        let type_hint = if names.len() == 1 && self.check(&TokenKind::Colon) {
            self.advance();
            Some(TypeHint(self.expect_identifier()?))
        } else {
            None
        };

        self.expect(TokenKind::Eq, "'='")?;
        let initializer = self.parse_expr()?;
        self.eat_semicolon();
        Ok(StmtNode::new(Stmt::VarDecl { names, initializer, is_const, type_hint }, tok))
    }

    fn parse_params(&mut self) -> PResult<Vec<String>> {
        self.expect(TokenKind::LParen, "'('")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let name = self.expect_identifier()?;
                // optional `: Type` hint on a parameter — parsed, discarded.
                if self.check(&TokenKind::Colon) {
                    self.advance();
                    self.expect_identifier()?;
                }
                params.push(name);
                if self.check(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(params)
    }

    fn parse_fn_decl(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // fn
        let name = self.expect_identifier()?;
        let params = self.parse_params()?;
        let return_type = self.parse_optional_return_type()?;
        let body = self.parse_block()?;
        Ok(StmtNode::new(Stmt::FunctionDef { name, params, body, return_type }, tok))
    }

    fn parse_optional_return_type(&mut self) -> PResult<Option<String>> {
        if self.check(&TokenKind::Arrow) {
            self.advance();
            Ok(Some(self.expect_identifier()?))
        } else {
            Ok(None)
        }
    }

    fn parse_if(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // if
        let condition = self.parse_expr()?;
        let then_branch = self.parse_block()?;
        let else_branch = if self.check(&TokenKind::Else) {
            self.advance();
            if self.check(&TokenKind::If) {
                let inner_tok = self.token_here();
                Some(vec![self.parse_if(inner_tok)?])
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };
        Ok(StmtNode::new(Stmt::If { condition, then_branch, else_branch }, tok))
    }

    fn parse_while(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // while
        let condition = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtNode::new(Stmt::While { condition, body }, tok))
    }

    fn parse_for(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // for
        let loop_var = self.expect_identifier()?;
        self.expect(TokenKind::In, "'in'")?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(StmtNode::new(Stmt::ForIn { loop_var, iterable, body }, tok))
    }

    fn parse_return(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // return
        let value = if self.check(&TokenKind::Semicolon)
            || self.check(&TokenKind::RBrace)
            || self.is_eof()
        {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.eat_semicolon();
        Ok(StmtNode::new(Stmt::Return(value), tok))
    }

    fn parse_use(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        self.advance(); // use
        let mut path = vec![self.expect_identifier()?];
        while self.check(&TokenKind::Dot) {
            self.advance();
            path.push(self.expect_identifier()?);
        }
        let alias = if self.check(&TokenKind::As) {
            self.advance();
            Some(self.expect_identifier()?)
        } else {
            None
        };
        self.eat_semicolon();
        Ok(StmtNode::new(Stmt::Use { path, alias }, tok))
    }

    /// Disambiguates plain expression statements from assignment forms by
    /// parsing a full expression first and inspecting its shape — matches
    /// the compiler's documented split (`SetAttr` is its own AST shape, not
    /// a general lvalue expression; spec §4.3).
    fn parse_assign_or_expr_stmt(&mut self, tok: crate::ast::Token) -> PResult<StmtNode> {
        let expr = self.parse_expr()?;

        let compound_op = match self.peek_kind() {
            TokenKind::PlusEq => Some("+"),
            TokenKind::MinusEq => Some("-"),
            TokenKind::StarEq => Some("*"),
            TokenKind::SlashEq => Some("/"),
            TokenKind::PercentEq => Some("%"),
            _ => None,
        };

        if let Some(op) = compound_op {
            self.advance();
            let value = self.parse_expr()?;
            self.eat_semicolon();
            let name = match expr.kind {
                Expr::Variable(name) => name,
                _ => {
                    return Err(PyleError::syntactic(
                        "compound assignment target must be a variable",
                        tok_to_loc(&tok),
                    ))
                }
            };
            return Ok(StmtNode::new(
                Stmt::CompoundAssign { name, op: op.to_string(), value },
                tok,
            ));
        }

        if self.check(&TokenKind::Eq) {
            self.advance();
            let value = self.parse_expr()?;
            self.eat_semicolon();
            return Ok(StmtNode::new(self.build_assignment(expr, value, &tok)?, tok));
        }

        self.eat_semicolon();
        Ok(StmtNode::new(Stmt::ExprStmt(expr), tok))
    }

    fn build_assignment(
        &self,
        target: ExprNode,
        value: ExprNode,
        tok: &crate::ast::Token,
    ) -> PResult<Stmt> {
        match target.kind {
            Expr::Variable(name) => Ok(Stmt::Assign { name, value }),
            Expr::Index { collection, index } => {
                Ok(Stmt::IndexAssign { collection: *collection, index: *index, value })
            }
            Expr::Dot { obj, attr } => Ok(Stmt::SetAttr { obj: *obj, attr, value }),
            _ => Err(PyleError::syntactic("invalid assignment target", tok_to_loc(tok))),
        }
    }

    // --- expressions --------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<ExprNode> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            let tok = self.token_here();
            self.advance();
            let right = self.parse_and()?;
            left = ExprNode::new(
                Expr::LogicalOp { left: Box::new(left), op: "||".into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_equality()?;
        while self.check(&TokenKind::AndAnd) {
            let tok = self.token_here();
            self.advance();
            let right = self.parse_equality()?;
            left = ExprNode::new(
                Expr::LogicalOp { left: Box::new(left), op: "&&".into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => "==",
                TokenKind::BangEq => "!=",
                _ => break,
            };
            let tok = self.token_here();
            self.advance();
            let right = self.parse_relational()?;
            left = ExprNode::new(
                Expr::ComparisonOp { left: Box::new(left), op: op.into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_range()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => "<",
                TokenKind::Gt => ">",
                TokenKind::LtEq => "<=",
                TokenKind::GtEq => ">=",
                _ => break,
            };
            let tok = self.token_here();
            self.advance();
            let right = self.parse_range()?;
            left = ExprNode::new(
                Expr::ComparisonOp { left: Box::new(left), op: op.into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_range(&mut self) -> PResult<ExprNode> {
        let start = self.parse_additive()?;
        if self.check(&TokenKind::DotDot) {
            let tok = self.token_here();
            self.advance();
            let end = self.parse_additive()?;
            let step = if self.check(&TokenKind::Colon) {
                self.advance();
                Some(Box::new(self.parse_additive()?))
            } else {
                None
            };
            return Ok(ExprNode::new(
                Expr::Range { start: Box::new(start), end: Box::new(end), step },
                tok,
            ));
        }
        Ok(start)
    }

    fn parse_additive(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => "+",
                TokenKind::Minus => "-",
                _ => break,
            };
            let tok = self.token_here();
            self.advance();
            let right = self.parse_multiplicative()?;
            left = ExprNode::new(
                Expr::BinaryOp { left: Box::new(left), op: op.into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<ExprNode> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => "*",
                TokenKind::Slash => "/",
                TokenKind::Percent => "%",
                _ => break,
            };
            let tok = self.token_here();
            self.advance();
            let right = self.parse_unary()?;
            left = ExprNode::new(
                Expr::BinaryOp { left: Box::new(left), op: op.into(), right: Box::new(right) },
                tok,
            );
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> PResult<ExprNode> {
        let tok = self.token_here();
        match self.peek_kind() {
            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(ExprNode::new(
                    Expr::UnaryOp { op: "!".into(), operand: Box::new(operand) },
                    tok,
                ))
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(ExprNode::new(
                    Expr::UnaryOp { op: "-".into(), operand: Box::new(operand) },
                    tok,
                ))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> PResult<ExprNode> {
        let mut expr = self.parse_primary()?;
        loop {
            let tok = self.token_here();
            match self.peek_kind().clone() {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.check(&TokenKind::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen, "')'")?;
                    expr = ExprNode::new(
                        Expr::Call { callee: Box::new(expr), args },
                        tok,
                    );
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "']'")?;
                    expr = ExprNode::new(
                        Expr::Index { collection: Box::new(expr), index: Box::new(index) },
                        tok,
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect_identifier()?;
                    expr = ExprNode::new(Expr::Dot { obj: Box::new(expr), attr }, tok);
                }
                TokenKind::Question => {
                    self.advance();
                    expr = ExprNode::new(
                        Expr::UnaryOp { op: "try".into(), operand: Box::new(expr) },
                        tok,
                    );
                }
                TokenKind::Bang => {
                    self.advance();
                    expr = ExprNode::new(
                        Expr::UnaryOp { op: "unwrap".into(), operand: Box::new(expr) },
                        tok,
                    );
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> PResult<ExprNode> {
        let tok = self.token_here();
        match self.peek_kind().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(ExprNode::new(Expr::Number(n as f64, true), tok))
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(ExprNode::new(Expr::Number(n, false), tok))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(ExprNode::new(Expr::String(s), tok))
            }
            TokenKind::True => {
                self.advance();
                Ok(ExprNode::new(Expr::Bool(true), tok))
            }
            TokenKind::False => {
                self.advance();
                Ok(ExprNode::new(Expr::Bool(false), tok))
            }
            TokenKind::Null => {
                self.advance();
                Ok(ExprNode::new(Expr::Null, tok))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(ExprNode::new(Expr::Variable(name), tok))
            }
            TokenKind::Fn => self.parse_fn_expr(tok),
            TokenKind::LParen => self.parse_paren_or_tuple(tok),
            TokenKind::LBracket => self.parse_array_literal(tok),
            TokenKind::LBrace => self.parse_map_literal(tok),
            other => Err(PyleError::syntactic(
                format!("unexpected token {:?}", other),
                self.location_here(),
            )),
        }
    }

    fn parse_fn_expr(&mut self, tok: crate::ast::Token) -> PResult<ExprNode> {
        self.advance(); // fn
        let params = self.parse_params()?;
        let return_type = self.parse_optional_return_type()?;
        let body = self.parse_block()?;
        Ok(ExprNode::new(Expr::FunctionExpr { params, body, return_type }, tok))
    }

    fn parse_paren_or_tuple(&mut self, tok: crate::ast::Token) -> PResult<ExprNode> {
        self.advance(); // (
        if self.check(&TokenKind::RParen) {
            self.advance();
            return Ok(ExprNode::new(Expr::Tuple(Vec::new()), tok));
        }
        let first = self.parse_expr()?;
        if self.check(&TokenKind::Comma) {
            let mut elements = vec![first];
            while self.check(&TokenKind::Comma) {
                self.advance();
                if self.check(&TokenKind::RParen) {
                    break;
                }
                elements.push(self.parse_expr()?);
            }
            self.expect(TokenKind::RParen, "')'")?;
            Ok(ExprNode::new(Expr::Tuple(elements), tok))
        } else {
            self.expect(TokenKind::RParen, "')'")?;
            Ok(first)
        }
    }

    fn parse_array_literal(&mut self, tok: crate::ast::Token) -> PResult<ExprNode> {
        self.advance(); // [
        let mut elements = Vec::new();
        if !self.check(&TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expr()?);
                if self.check(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RBracket, "']'")?;
        Ok(ExprNode::new(Expr::Array(elements), tok))
    }

    fn parse_map_literal(&mut self, tok: crate::ast::Token) -> PResult<ExprNode> {
        self.advance(); // {
        let mut props = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = if self.check(&TokenKind::LBracket) {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RBracket, "']'")?;
                MapKey::Computed(Box::new(expr))
            } else if let TokenKind::Str(s) = self.peek_kind().clone() {
                self.advance();
                MapKey::Name(s)
            } else {
                MapKey::Name(self.expect_identifier()?)
            };
            self.expect(TokenKind::Colon, "':'")?;
            let value = self.parse_expr()?;
            props.push(MapProperty { key, value });
            if self.check(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'")?;
        Ok(ExprNode::new(Expr::Map(props), tok))
    }
}

fn tok_to_loc(tok: &crate::ast::Token) -> SourceLocation {
    SourceLocation::with_file(tok.line, tok.col_start, tok.file.clone())
}

/// Convenience entry point mirroring the lexer's free function.
pub fn parse(tokens: Vec<Token>, file: &str) -> PResult<Vec<StmtNode>> {
    Parser::new(tokens, file).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse_src(src: &str) -> Vec<StmtNode> {
        let tokens = tokenize(src, "t.pyle").unwrap();
        parse(tokens, "t.pyle").unwrap()
    }

    #[test]
    fn parses_let_and_if() {
        let stmts = parse_src("let x = 1\nif x < 2 { x = 3 }");
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, Stmt::VarDecl { .. }));
        assert!(matches!(stmts[1].kind, Stmt::If { .. }));
    }

    #[test]
    fn parses_multi_name_let_for_unpack() {
        let stmts = parse_src("let v, e = parse(\"x\")");
        match &stmts[0].kind {
            Stmt::VarDecl { names, .. } => assert_eq!(names, &vec!["v".to_string(), "e".to_string()]),
            _ => panic!("expected VarDecl"),
        }
    }

    #[test]
    fn parses_closure_function_expr() {
        let stmts = parse_src("let f = fn(x) { return x + 1 }");
        match &stmts[0].kind {
            Stmt::VarDecl { initializer, .. } => {
                assert!(matches!(initializer.kind, Expr::FunctionExpr { .. }));
            }
            _ => panic!("expected VarDecl"),
        }
    }

    #[test]
    fn parses_dot_assignment_as_setattr() {
        let stmts = parse_src("obj.field = 5");
        assert!(matches!(stmts[0].kind, Stmt::SetAttr { .. }));
    }
}
