use serde_json::Value;

use super::lexer::{Spanned, Token};
use super::ScriptError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Stmt {
    Let(String, Expr),
    Assign(Place, Expr),
    If(Expr, Vec<Stmt>, Vec<Stmt>),
    Return(Option<Expr>),
    Expr(Expr),
}

/// Assignment target: a variable followed by field or index accessors
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Place {
    pub root: String,
    pub path: Vec<Accessor>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Accessor {
    Field(String),
    Index(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
    Nullish,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Var(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

pub(crate) fn parse(tokens: Vec<Spanned>, source_len: usize) -> Result<Vec<Stmt>, ScriptError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: source_len,
    };
    let mut program = Vec::new();
    while !parser.at_end() {
        program.push(parser.statement()?);
    }
    Ok(program)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|s| s.offset).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), ScriptError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: String) -> ScriptError {
        let found = match self.peek() {
            Some(token) => format!("{:?}", token),
            None => "end of script".to_string(),
        };
        ScriptError::Syntax {
            offset: self.offset(),
            message: format!("{}, found {}", message, found),
        }
    }

    /// Statement terminators are optional before `}` and at the end of the script.
    fn end_statement(&mut self) -> Result<(), ScriptError> {
        if self.eat(&Token::Semicolon) || self.at_end() || self.peek() == Some(&Token::RBrace) {
            Ok(())
        } else {
            Err(self.error("expected ';'".to_string()))
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Let) => {
                self.advance();
                let name = match self.advance() {
                    Some(Token::Ident(name)) => name,
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected variable name".to_string()));
                    }
                };
                self.expect(Token::Assign, "'='")?;
                let value = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Let(name, value))
            }
            Some(Token::If) => {
                self.advance();
                self.expect(Token::LParen, "'('")?;
                let condition = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                let then_branch = self.block_or_statement()?;
                let else_branch = if self.eat(&Token::Else) {
                    self.block_or_statement()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If(condition, then_branch, else_branch))
            }
            Some(Token::Return) => {
                self.advance();
                let value = match self.peek() {
                    None | Some(Token::Semicolon) | Some(Token::RBrace) => None,
                    _ => Some(self.expression()?),
                };
                self.end_statement()?;
                Ok(Stmt::Return(value))
            }
            Some(Token::Semicolon) => {
                self.advance();
                Ok(Stmt::Expr(Expr::Literal(Value::Null)))
            }
            _ => {
                let start = self.offset();
                let expr = self.expression()?;
                if self.eat(&Token::Assign) {
                    let place = into_place(expr).ok_or(ScriptError::Syntax {
                        offset: start,
                        message: "invalid assignment target".to_string(),
                    })?;
                    let value = self.expression()?;
                    self.end_statement()?;
                    Ok(Stmt::Assign(place, value))
                } else {
                    self.end_statement()?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn block_or_statement(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        if self.eat(&Token::LBrace) {
            let mut body = Vec::new();
            while !self.eat(&Token::RBrace) {
                if self.at_end() {
                    return Err(self.error("expected '}'".to_string()));
                }
                body.push(self.statement()?);
            }
            Ok(body)
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        let condition = self.nullish()?;
        if self.eat(&Token::Question) {
            let then_value = self.expression()?;
            self.expect(Token::Colon, "':'")?;
            let else_value = self.expression()?;
            return Ok(Expr::Conditional(
                Box::new(condition),
                Box::new(then_value),
                Box::new(else_value),
            ));
        }
        Ok(condition)
    }

    fn nullish(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.or()?;
        while self.eat(&Token::Nullish) {
            let right = self.or()?;
            left = Expr::Logical(LogicalOp::Nullish, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Logical(LogicalOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = Expr::Logical(LogicalOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::NotEq,
                Some(Token::StrictEq) => BinaryOp::StrictEq,
                Some(Token::StrictNotEq) => BinaryOp::StrictNotEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.comparison()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::LtEq) => BinaryOp::LtEq,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::GtEq) => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.additive()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Plus) {
            let operand = self.unary()?;
            return Ok(Expr::Call(
                Box::new(Expr::Var("Number".to_string())),
                vec![operand],
            ));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    _ => {
                        self.pos -= 1;
                        return Err(self.error("expected property name".to_string()));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expression()?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat(&Token::LParen) {
                let args = self.list(Token::RParen)?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn list(&mut self, close: Token) -> Result<Vec<Expr>, ScriptError> {
        let mut items = Vec::new();
        if self.eat(&close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(&close) {
                return Ok(items);
            }
            self.expect(Token::Comma, "','")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        let token = match self.advance() {
            Some(token) => token,
            None => {
                self.pos -= 1;
                return Err(self.error("expected expression".to_string()));
            }
        };
        match token {
            Token::Number(n) => Ok(Expr::Literal(super::eval::number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null | Token::Undefined => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Var(name)),
            Token::LParen => {
                let expr = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::LBracket => Ok(Expr::Array(self.list(Token::RBracket)?)),
            Token::LBrace => self.object(),
            _ => {
                self.pos -= 1;
                Err(self.error("expected expression".to_string()))
            }
        }
    }

    fn object(&mut self) -> Result<Expr, ScriptError> {
        let mut fields = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(Expr::Object(fields));
        }
        loop {
            let key = match self.advance() {
                Some(Token::Ident(name)) | Some(Token::Str(name)) => name,
                _ => {
                    self.pos -= 1;
                    return Err(self.error("expected object key".to_string()));
                }
            };
            self.expect(Token::Colon, "':'")?;
            fields.push((key, self.expression()?));
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(fields));
            }
            self.expect(Token::Comma, "','")?;
            // trailing comma
            if self.eat(&Token::RBrace) {
                return Ok(Expr::Object(fields));
            }
        }
    }
}

fn into_place(expr: Expr) -> Option<Place> {
    let mut path = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Var(root) => {
                path.reverse();
                return Some(Place { root, path });
            }
            Expr::Member(base, field) => {
                path.push(Accessor::Field(field));
                current = *base;
            }
            Expr::Index(base, index) => {
                path.push(Accessor::Index(*index));
                current = *base;
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;

    fn parse_source(source: &str) -> Result<Vec<Stmt>, ScriptError> {
        parse(tokenize(source)?, source.len())
    }

    #[test]
    fn assignment_targets_become_places() {
        let program = parse_source("state.global.count = 1;").unwrap();
        assert_eq!(
            program,
            vec![Stmt::Assign(
                Place {
                    root: "state".into(),
                    path: vec![
                        Accessor::Field("global".into()),
                        Accessor::Field("count".into())
                    ],
                },
                Expr::Literal(serde_json::json!(1)),
            )]
        );
    }

    #[test]
    fn ternary_binds_looser_than_comparison() {
        let program = parse_source("return message > 1 ? 'a' : 'b'").unwrap();
        match &program[0] {
            Stmt::Return(Some(Expr::Conditional(cond, _, _))) => {
                assert!(matches!(**cond, Expr::Binary(BinaryOp::Gt, _, _)))
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn rejects_assignment_to_call() {
        assert!(parse_source("String(message) = 1;").is_err());
    }

    #[test]
    fn rejects_unbalanced_parentheses() {
        assert!(parse_source("return (message + 1;").is_err());
    }
}
