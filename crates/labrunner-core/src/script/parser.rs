//! Recursive descent parser producing a [`Program`].

use std::sync::Arc;

use super::ast::{BinOp, CmpOp, Expr, FunctionDef, Program, Stmt, StmtKind, Target, UnaryOp};
use super::lexer::{SpannedToken, SyntaxError, Token, tokenize};

const KEYWORDS: &[&str] = &[
    "and", "break", "continue", "def", "del", "elif", "else", "False", "for", "if", "in", "None",
    "not", "or", "pass", "raise", "return", "True", "while",
];

/// Parse a code unit.
pub fn parse(source: &str, filename: &str) -> Result<Program, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        filename: filename.to_string(),
        loop_depth: 0,
        function_depth: 0,
    };
    let body = parser.parse_statements_until_eof()?;
    Ok(Program {
        filename: filename.to_string(),
        body,
    })
}

struct Parser {
    tokens: Vec<SpannedToken>,
    pos: usize,
    filename: String,
    loop_depth: usize,
    function_depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Name(name) if name == keyword)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), SyntaxError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {}", token)))
        }
    }

    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        match self.peek().clone() {
            Token::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("expected a name")),
        }
    }

    fn unexpected(&self, context: &str) -> SyntaxError {
        SyntaxError::new(
            format!("invalid syntax: {}, found {}", context, self.peek()),
            self.line(),
        )
    }

    fn parse_statements_until_eof(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        while !self.check(&Token::Eof) {
            if self.eat(&Token::Newline) {
                continue;
            }
            if self.check(&Token::Indent) {
                return Err(SyntaxError::new("unexpected indent", self.line()));
            }
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    /// Parse the suite following a `:`.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.expect(&Token::Colon)?;

        if !self.check(&Token::Newline) {
            let stmt = self.parse_simple_statement()?;
            self.expect_end_of_statement()?;
            return Ok(vec![stmt]);
        }

        self.expect(&Token::Newline)?;
        if !self.eat(&Token::Indent) {
            return Err(SyntaxError::new("expected an indented block", self.line()));
        }

        let mut body = Vec::new();
        while !self.eat(&Token::Dedent) {
            if self.check(&Token::Eof) {
                break;
            }
            if self.eat(&Token::Newline) {
                continue;
            }
            body.push(self.parse_statement()?);
        }
        Ok(body)
    }

    fn expect_end_of_statement(&mut self) -> Result<(), SyntaxError> {
        if self.eat(&Token::Newline) || self.check(&Token::Eof) || self.check(&Token::Dedent) {
            Ok(())
        } else {
            Err(self.unexpected("expected end of statement"))
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let kind = if self.eat_keyword("if") {
            self.parse_if()?
        } else if self.eat_keyword("while") {
            let cond = self.parse_expr()?;
            let body = self.parse_loop_body()?;
            StmtKind::While { cond, body }
        } else if self.eat_keyword("for") {
            let var = self.expect_name()?;
            if !self.eat_keyword("in") {
                return Err(self.unexpected("expected 'in'"));
            }
            let iter = self.parse_expr()?;
            let body = self.parse_loop_body()?;
            StmtKind::For { var, iter, body }
        } else if self.eat_keyword("def") {
            self.parse_def(line)?
        } else {
            let stmt = self.parse_simple_statement()?;
            self.expect_end_of_statement()?;
            return Ok(stmt);
        };
        Ok(Stmt { kind, line })
    }

    fn parse_loop_body(&mut self) -> Result<Vec<Stmt>, SyntaxError> {
        self.loop_depth += 1;
        let body = self.parse_block();
        self.loop_depth -= 1;
        body
    }

    fn parse_if(&mut self) -> Result<StmtKind, SyntaxError> {
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        branches.push((cond, self.parse_block()?));

        let mut orelse = Vec::new();
        loop {
            if self.eat_keyword("elif") {
                let cond = self.parse_expr()?;
                branches.push((cond, self.parse_block()?));
            } else if self.eat_keyword("else") {
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn parse_def(&mut self, line: usize) -> Result<StmtKind, SyntaxError> {
        let name = self.expect_name()?;
        self.expect(&Token::LParen)?;
        let mut params: Vec<String> = Vec::new();
        while !self.check(&Token::RParen) {
            let param = self.expect_name()?;
            if params.contains(&param) {
                return Err(SyntaxError::new(
                    format!("duplicate argument '{}' in function definition", param),
                    self.line(),
                ));
            }
            params.push(param);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen)?;

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.function_depth += 1;
        let body = self.parse_block();
        self.function_depth -= 1;
        self.loop_depth = saved_loops;

        Ok(StmtKind::Def(Arc::new(FunctionDef {
            name,
            params,
            body: body?,
            filename: self.filename.clone(),
            line,
        })))
    }

    fn parse_simple_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let kind = if self.eat_keyword("pass") {
            StmtKind::Pass
        } else if self.check_keyword("break") || self.check_keyword("continue") {
            let is_break = self.check_keyword("break");
            if self.loop_depth == 0 {
                let word = if is_break { "break" } else { "continue" };
                return Err(SyntaxError::new(format!("'{}' outside loop", word), line));
            }
            self.advance();
            if is_break {
                StmtKind::Break
            } else {
                StmtKind::Continue
            }
        } else if self.check_keyword("return") {
            if self.function_depth == 0 {
                return Err(SyntaxError::new("'return' outside function", line));
            }
            self.advance();
            if self.at_statement_end() {
                StmtKind::Return(None)
            } else {
                StmtKind::Return(Some(self.parse_expr()?))
            }
        } else if self.eat_keyword("raise") {
            StmtKind::Raise(self.parse_expr()?)
        } else if self.eat_keyword("del") {
            StmtKind::Del(self.expect_name()?)
        } else {
            let expr = self.parse_expr()?;
            let aug = match self.peek() {
                Token::PlusAssign => Some(BinOp::Add),
                Token::MinusAssign => Some(BinOp::Sub),
                Token::StarAssign => Some(BinOp::Mul),
                Token::SlashAssign => Some(BinOp::Div),
                _ => None,
            };

            if let Some(op) = aug {
                self.advance();
                let target = self.to_target(expr, line)?;
                let value = self.parse_expr()?;
                StmtKind::AugAssign { target, op, value }
            } else if self.eat(&Token::Assign) {
                let target = self.to_target(expr, line)?;
                let value = self.parse_expr()?;
                StmtKind::Assign { target, value }
            } else {
                StmtKind::Expr(expr)
            }
        };
        Ok(Stmt { kind, line })
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Token::Newline | Token::Eof | Token::Dedent)
    }

    fn to_target(&self, expr: Expr, line: usize) -> Result<Target, SyntaxError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Index { object, index } => Ok(Target::Index {
                object: *object,
                index: *index,
            }),
            Expr::Attr { object, name } => Ok(Target::Attr {
                object: *object,
                name,
            }),
            _ => Err(SyntaxError::new("cannot assign to expression", line)),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_keyword("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_additive()?;
        loop {
            let not_in = self.check_keyword("not")
                && matches!(self.peek_at(1), Token::Name(next) if next == "in");
            let op = match self.peek() {
                Token::EqEq => CmpOp::Eq,
                Token::NotEq => CmpOp::NotEq,
                Token::Lt => CmpOp::Lt,
                Token::Le => CmpOp::Le,
                Token::Gt => CmpOp::Gt,
                Token::Ge => CmpOp::Ge,
                Token::Name(name) if name == "in" => CmpOp::In,
                _ if not_in => CmpOp::NotIn,
                _ => break,
            };
            if not_in {
                self.advance();
            }
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Compare {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::SlashSlash => BinOp::FloorDiv,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Plus) {
            return self.parse_unary();
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::StarStar) {
            // Right associative, and binds tighter than a unary minus on its left.
            let exponent = self.parse_unary()?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat(&Token::LParen) {
                let args = self.parse_sequence(&Token::RParen)?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&Token::Dot) {
                let name = self.expect_name()?;
                expr = Expr::Attr {
                    object: Box::new(expr),
                    name,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Comma separated expressions up to `close`, trailing comma allowed.
    fn parse_sequence(&mut self, close: &Token) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_atom(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek().clone() {
            Token::Int(v) => {
                self.advance();
                Ok(Expr::Int(v))
            }
            Token::Float(v) => {
                self.advance();
                Ok(Expr::Float(v))
            }
            Token::Str(text) => {
                self.advance();
                // Adjacent literals concatenate.
                let mut text = text;
                while let Token::Str(more) = self.peek().clone() {
                    self.advance();
                    text.push_str(&more);
                }
                Ok(Expr::Str(text))
            }
            Token::Name(name) => match name.as_str() {
                "None" => {
                    self.advance();
                    Ok(Expr::None)
                }
                "True" => {
                    self.advance();
                    Ok(Expr::Bool(true))
                }
                "False" => {
                    self.advance();
                    Ok(Expr::Bool(false))
                }
                _ if KEYWORDS.contains(&name.as_str()) => {
                    Err(self.unexpected("expected an expression"))
                }
                _ => {
                    self.advance();
                    Ok(Expr::Name(name))
                }
            },
            Token::LParen => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => {
                self.advance();
                Ok(Expr::List(self.parse_sequence(&Token::RBracket)?))
            }
            Token::LBrace => {
                self.advance();
                let mut entries = Vec::new();
                while !self.check(&Token::RBrace) {
                    let key = self.parse_expr()?;
                    self.expect(&Token::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::Map(entries))
            }
            _ => Err(self.unexpected("expected an expression")),
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(source: &str) -> Vec<Stmt> {
        parse(source, "test.txt").unwrap().body
    }

    #[test]
    fn test_assignment() {
        let stmts = body("x = 1 + 2 * 3");
        assert_eq!(stmts.len(), 1);
        match &stmts[0].kind {
            StmtKind::Assign {
                target: Target::Name(name),
                value: Expr::Binary { op: BinOp::Add, right, .. },
            } => {
                assert_eq!(name, "x");
                assert!(matches!(**right, Expr::Binary { op: BinOp::Mul, .. }));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_single_line_suite() {
        let stmts = body("while True: pass");
        match &stmts[0].kind {
            StmtKind::While { cond, body } => {
                assert_eq!(*cond, Expr::Bool(true));
                assert_eq!(body[0].kind, StmtKind::Pass);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_if_elif_else() {
        let stmts = body("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\ny = x\n");
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
        assert_eq!(stmts[1].line, 7);
    }

    #[test]
    fn test_def_records_location() {
        let stmts = body("\n\ndef twice(v):\n    return v * 2\n");
        match &stmts[0].kind {
            StmtKind::Def(def) => {
                assert_eq!(def.name, "twice");
                assert_eq!(def.params, vec!["v".to_string()]);
                assert_eq!(def.filename, "test.txt");
                assert_eq!(def.line, 3);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_power_precedence() {
        let stmts = body("y = -2 ** 2");
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value, Expr::Unary { op: UnaryOp::Neg, .. }));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_attribute_and_index_targets() {
        let stmts = body("globals.count = 1\nglobals['x'] += 2\n");
        assert!(matches!(
            stmts[0].kind,
            StmtKind::Assign { target: Target::Attr { .. }, .. }
        ));
        assert!(matches!(
            stmts[1].kind,
            StmtKind::AugAssign { target: Target::Index { .. }, op: BinOp::Add, .. }
        ));
    }

    #[test]
    fn test_not_in() {
        let stmts = body("ok = 3 not in [1, 2]");
        match &stmts[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value, Expr::Compare { op: CmpOp::NotIn, .. }));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_misplaced_control_flow() {
        assert!(parse("break", "t").is_err());
        assert!(parse("return 1", "t").is_err());
        assert!(parse("def f():\n    while x:\n        pass\n    break\n", "t").is_err());
        assert!(parse("1 = x", "t").is_err());
        assert!(parse("    x = 1", "t").is_err());
        assert!(parse("if x:\ny = 1", "t").is_err());
    }
}
