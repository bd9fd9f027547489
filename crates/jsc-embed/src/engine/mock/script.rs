//! Parser for the expression subset understood by [`MockEngine`](super::MockEngine).

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    This,
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Function(Arc<FunctionDef>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    New(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Expr(Expr),
    /// `var`/`let`/`const` and function declarations
    Declare(String, Expr),
    Assign(Expr, Expr),
    Throw(Expr),
    Return(Option<Expr>),
}

#[derive(Debug, PartialEq)]
pub(crate) struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: Vec<Line>,
}

/// A statement and the absolute line it starts on
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Line {
    pub line: i32,
    pub stmt: Stmt,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(char),
    Eof,
}

/// Parse failure and the absolute line it was detected on
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyntaxError {
    pub message: String,
    pub line: i32,
}

type ParseResult<T> = Result<T, SyntaxError>;

fn tokenize(source: &str, starting_line: i32) -> ParseResult<Vec<(Token, i32)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = starting_line;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_whitespace() {
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if matches!(chars.get(i), Some(&('e' | 'E'))) {
                let sign = usize::from(matches!(chars.get(i + 1), Some(&('+' | '-'))));
                if chars.get(i + 1 + sign).is_some_and(char::is_ascii_digit) {
                    i += 1 + sign;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = text.parse::<f64>().map_err(|_| SyntaxError {
                message: format!("Invalid number literal '{}'", text),
                line,
            })?;
            tokens.push((Token::Number(number), line));
        } else if c == '\'' || c == '"' {
            i += 1;
            let mut text = String::new();
            loop {
                match chars.get(i) {
                    None => {
                        return Err(SyntaxError {
                            message: "Unterminated string literal".into(),
                            line,
                        });
                    }
                    Some(&q) if q == c => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = match chars.get(i + 1) {
                            Some('n') => '\n',
                            Some('t') => '\t',
                            Some(&other) => other,
                            None => '\\',
                        };
                        text.push(escaped);
                        i += 2;
                    }
                    Some(&other) => {
                        text.push(other);
                        i += 1;
                    }
                }
            }
            tokens.push((Token::Str(text), line));
        } else if c.is_alphabetic() || c == '_' || c == '$' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push((Token::Ident(chars[start..i].iter().collect()), line));
        } else if "+-*/%()[]{},.;:=".contains(c) {
            tokens.push((Token::Punct(c), line));
            i += 1;
        } else {
            return Err(SyntaxError {
                message: format!("Unexpected character '{}'", c),
                line,
            });
        }
    }

    tokens.push((Token::Eof, line));
    Ok(tokens)
}

/// Parse a script whose first line is `starting_line`
pub(crate) fn parse(source: &str, starting_line: i32) -> ParseResult<Vec<Line>> {
    let mut parser = Parser {
        tokens: tokenize(source, starting_line)?,
        pos: 0,
    };
    let body = parser.statements()?;
    match parser.peek() {
        Token::Eof => Ok(body),
        other => Err(parser.unexpected(&other.clone())),
    }
}

struct Parser {
    tokens: Vec<(Token, i32)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn line(&self) -> i32 {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].0.clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: char) -> bool {
        if *self.peek() == Token::Punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Token::Ident(name) if name == keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: char) -> ParseResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            let token = self.peek().clone();
            Err(self.unexpected(&token))
        }
    }

    fn unexpected(&self, token: &Token) -> SyntaxError {
        let message = match token {
            Token::Eof => "Unexpected end of script".to_string(),
            Token::Number(n) => format!("Unexpected number '{}'", n),
            Token::Str(_) => "Unexpected string literal".to_string(),
            Token::Ident(name) => format!("Unexpected identifier '{}'", name),
            Token::Punct(c) => format!("Unexpected token '{}'", c),
        };
        SyntaxError {
            message,
            line: self.line(),
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected(&other))
            }
        }
    }

    fn statements(&mut self) -> ParseResult<Vec<Line>> {
        let mut body = Vec::new();
        loop {
            while self.eat(';') {}
            if matches!(self.peek(), Token::Eof | Token::Punct('}')) {
                return Ok(body);
            }
            let line = self.line();
            body.push(Line {
                line,
                stmt: self.statement()?,
            });
        }
    }

    fn statement(&mut self) -> ParseResult<Stmt> {
        if self.eat_keyword("throw") {
            return Ok(Stmt::Throw(self.expression()?));
        }
        if self.eat_keyword("return") {
            if matches!(self.peek(), Token::Eof | Token::Punct(';') | Token::Punct('}')) {
                return Ok(Stmt::Return(None));
            }
            return Ok(Stmt::Return(Some(self.expression()?)));
        }
        if self.eat_keyword("var") || self.eat_keyword("let") || self.eat_keyword("const") {
            let name = self.ident()?;
            let value = if self.eat('=') {
                self.expression()?
            } else {
                Expr::Undefined
            };
            return Ok(Stmt::Declare(name, value));
        }

        let expr = self.expression()?;
        if self.eat('=') {
            return match expr {
                Expr::Ident(_) | Expr::Member(..) | Expr::Index(..) => {
                    Ok(Stmt::Assign(expr, self.expression()?))
                }
                _ => Err(SyntaxError {
                    message: "Invalid left-hand side in assignment".into(),
                    line: self.line(),
                }),
            };
        }
        if let Expr::Function(def) = &expr {
            if let Some(name) = &def.name {
                return Ok(Stmt::Declare(name.clone(), expr.clone()));
            }
        }
        Ok(Stmt::Expr(expr))
    }

    fn expression(&mut self) -> ParseResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = if self.eat('+') {
                BinOp::Add
            } else if self.eat('-') {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            left = Expr::Binary(op, Box::new(left), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> ParseResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = if self.eat('*') {
                BinOp::Mul
            } else if self.eat('/') {
                BinOp::Div
            } else if self.eat('%') {
                BinOp::Rem
            } else {
                return Ok(left);
            };
            left = Expr::Binary(op, Box::new(left), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> ParseResult<Expr> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat('+') {
            return self.unary();
        }
        self.postfix()
    }

    fn postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat('.') {
                expr = Expr::Member(Box::new(expr), self.ident()?);
            } else if self.eat('[') {
                let index = self.expression()?;
                self.expect(']')?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat('(') {
                expr = Expr::Call(Box::new(expr), self.arguments()?);
            } else {
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to the closing `)`
    fn arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.list(')')
    }

    fn list(&mut self, close: char) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(',')?;
        }
    }

    fn primary(&mut self) -> ParseResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Punct('(') => {
                let expr = self.expression()?;
                self.expect(')')?;
                Ok(expr)
            }
            Token::Punct('[') => Ok(Expr::Array(self.list(']')?)),
            Token::Punct('{') => self.object_literal(),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                "undefined" => Ok(Expr::Undefined),
                "this" => Ok(Expr::This),
                "new" => self.new_expression(),
                "function" => self.function(),
                _ => Ok(Expr::Ident(name)),
            },
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected(&other))
            }
        }
    }

    fn object_literal(&mut self) -> ParseResult<Expr> {
        let mut properties = Vec::new();
        if self.eat('}') {
            return Ok(Expr::Object(properties));
        }
        loop {
            let key = match self.advance() {
                Token::Ident(name) | Token::Str(name) => name,
                Token::Number(n) => super::format_number(n),
                other => {
                    self.pos = self.pos.saturating_sub(1);
                    return Err(self.unexpected(&other));
                }
            };
            self.expect(':')?;
            properties.push((key, self.expression()?));
            if self.eat('}') {
                return Ok(Expr::Object(properties));
            }
            self.expect(',')?;
        }
    }

    fn new_expression(&mut self) -> ParseResult<Expr> {
        let mut callee = Expr::Ident(self.ident()?);
        while self.eat('.') {
            callee = Expr::Member(Box::new(callee), self.ident()?);
        }
        let args = if self.eat('(') {
            self.arguments()?
        } else {
            Vec::new()
        };
        Ok(Expr::New(Box::new(callee), args))
    }

    fn function(&mut self) -> ParseResult<Expr> {
        let name = match self.peek() {
            Token::Ident(_) => Some(self.ident()?),
            _ => None,
        };
        self.expect('(')?;
        let mut params = Vec::new();
        if !self.eat(')') {
            loop {
                params.push(self.ident()?);
                if self.eat(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        self.expect('{')?;
        let body = self.statements()?;
        self.expect('}')?;
        Ok(Expr::Function(Arc::new(FunctionDef { name, params, body })))
    }
}
