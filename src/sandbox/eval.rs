use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use super::lexer::{Spanned, Token};
use super::{Budget, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    Void,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Undefined,
    Ident(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Member(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Function(Box<Function>),
    Call(Box<Function>, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    params: Vec<String>,
    body: Vec<Stmt>,
}

/// Assignment target: a binding plus zero or more member keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    root: String,
    path: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Declare(Vec<(String, Option<Expr>)>),
    Assign(Target, Expr),
    Expr(Expr),
    Return(Option<Expr>),
}

pub struct Parser<'t> {
    tokens: &'t [Spanned],
    pos: usize,
    depth: usize,
    budget: Budget,
}

impl<'t> Parser<'t> {
    pub fn new(tokens: &'t [Spanned], budget: Budget) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            budget,
        }
    }

    pub fn parse_program(mut self) -> Result<Vec<Stmt>, SandboxError> {
        let mut statements = Vec::new();
        while !self.at(&Token::Eof) {
            if self.eat_punct(';') {
                continue;
            }
            statements.push(self.statement(false)?);
        }
        Ok(statements)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.pos)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == token
    }

    fn at_punct(&self, c: char) -> bool {
        matches!(self.peek(), Token::Punct(p) if *p == c)
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == word)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.at_punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), SandboxError> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("`{}`", c)))
        }
    }

    fn expect_ident(&mut self) -> Result<String, SandboxError> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("identifier"))
            }
        }
    }

    fn unexpected(&self, wanted: &str) -> SandboxError {
        SandboxError::syntax(
            self.offset(),
            format!("expected {}, found {:?}", wanted, self.peek()),
        )
    }

    fn enter(&mut self) -> Result<(), SandboxError> {
        self.depth += 1;
        self.budget.check_depth(self.depth)?;
        self.budget.check_deadline()
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn statement(&mut self, in_function: bool) -> Result<Stmt, SandboxError> {
        let stmt = if self.at_keyword("var") || self.at_keyword("let") || self.at_keyword("const") {
            self.advance();
            let mut bindings = Vec::new();
            loop {
                let name = self.expect_ident()?;
                let init = if self.eat_punct('=') {
                    Some(self.expr()?)
                } else {
                    None
                };
                bindings.push((name, init));
                if !self.eat_punct(',') {
                    break;
                }
            }
            Stmt::Declare(bindings)
        } else if self.at_keyword("return") {
            if !in_function {
                return Err(SandboxError::syntax(self.offset(), "return outside function"));
            }
            self.advance();
            if self.at_punct(';') || self.at_punct('}') || self.at(&Token::Eof) {
                Stmt::Return(None)
            } else {
                Stmt::Return(Some(self.expr()?))
            }
        } else {
            let expr = self.expr()?;
            if self.eat_punct('=') {
                let target = into_target(expr).ok_or_else(|| {
                    SandboxError::Unsupported("assignment to a non-reference".into())
                })?;
                Stmt::Assign(target, self.expr()?)
            } else {
                Stmt::Expr(expr)
            }
        };
        self.eat_punct(';');
        Ok(stmt)
    }

    fn expr(&mut self) -> Result<Expr, SandboxError> {
        self.enter()?;
        let result = self.unary();
        self.leave();
        result
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        let op = match self.peek() {
            Token::Punct('!') => Some(UnaryOp::Not),
            Token::Punct('-') => Some(UnaryOp::Neg),
            Token::Punct('+') => Some(UnaryOp::Plus),
            Token::Ident(s) if s == "void" => Some(UnaryOp::Void),
            Token::Ident(s) if matches!(s.as_str(), "new" | "typeof" | "delete" | "this" | "await" | "yield") => {
                return Err(SandboxError::Unsupported(format!("`{}`", s)));
            }
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                Ok(Expr::Unary(op, Box::new(self.expr()?)))
            }
            None => {
                let primary = self.primary()?;
                self.postfix(primary)
            }
        }
    }

    /// Each `.x`, `[k]` or call link nests the tree one level deeper, so
    /// links count toward the depth limit like any other nesting.
    fn postfix(&mut self, expr: Expr) -> Result<Expr, SandboxError> {
        let mut links = 0;
        let result = self.postfix_chain(expr, &mut links);
        self.depth -= links;
        result
    }

    fn postfix_chain(&mut self, mut expr: Expr, links: &mut usize) -> Result<Expr, SandboxError> {
        loop {
            if self.at_punct('.') || self.at_punct('[') || self.at_punct('(') {
                *links += 1;
                self.enter()?;
            }
            if self.eat_punct('.') {
                let name = self.expect_ident()?;
                expr = Expr::Member(Box::new(expr), Box::new(Expr::Literal(Value::String(name))));
            } else if self.eat_punct('[') {
                let key = self.expr()?;
                self.expect_punct(']')?;
                expr = Expr::Member(Box::new(expr), Box::new(key));
            } else if self.at_punct('(') {
                let func = match expr {
                    Expr::Function(func) => func,
                    _ => {
                        return Err(SandboxError::Unsupported(
                            "call of anything but an inline function expression".into(),
                        ))
                    }
                };
                self.advance();
                let args = self.list(')')?;
                expr = Expr::Call(func, args.into_iter().map(|a| a.unwrap_or(Expr::Undefined)).collect());
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        let offset = self.offset();
        match self.advance() {
            Token::Num(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "function" => self.function(),
                _ => Ok(Expr::Ident(word)),
            },
            Token::Punct('(') => {
                let inner = self.expr()?;
                self.expect_punct(')')?;
                Ok(inner)
            }
            Token::Punct('[') => {
                let items = self.list(']')?;
                Ok(Expr::Array(
                    items.into_iter().map(|i| i.unwrap_or(Expr::Undefined)).collect(),
                ))
            }
            Token::Punct('{') => self.object(),
            other => Err(SandboxError::syntax(
                offset,
                format!("unexpected {:?}", other),
            )),
        }
    }

    /// Comma-separated expressions up to `close`. `None` marks an elision.
    fn list(&mut self, close: char) -> Result<Vec<Option<Expr>>, SandboxError> {
        let mut items = Vec::new();
        loop {
            if self.eat_punct(close) {
                return Ok(items);
            }
            if self.eat_punct(',') {
                items.push(None);
                continue;
            }
            items.push(Some(self.expr()?));
            if !self.eat_punct(',') {
                self.expect_punct(close)?;
                return Ok(items);
            }
        }
    }

    fn object(&mut self) -> Result<Expr, SandboxError> {
        let mut props = Vec::new();
        loop {
            if self.eat_punct('}') {
                return Ok(Expr::Object(props));
            }
            let offset = self.offset();
            let (key, shorthand) = match self.advance() {
                Token::Ident(name) => (name, true),
                Token::Str(s) => (s, false),
                Token::Num(n) => (property_key(&number(n)), false),
                other => {
                    return Err(SandboxError::syntax(
                        offset,
                        format!("bad property key {:?}", other),
                    ))
                }
            };
            let value = if self.eat_punct(':') {
                self.expr()?
            } else if shorthand && (self.at_punct(',') || self.at_punct('}')) {
                Expr::Ident(key.clone())
            } else {
                return Err(SandboxError::Unsupported(format!(
                    "property `{}` is not a plain key/value pair",
                    key
                )));
            };
            props.push((key, value));
            if !self.eat_punct(',') {
                self.expect_punct('}')?;
                return Ok(Expr::Object(props));
            }
        }
    }

    fn function(&mut self) -> Result<Expr, SandboxError> {
        if matches!(self.peek(), Token::Ident(_)) {
            self.advance();
        }
        self.expect_punct('(')?;
        let mut params = Vec::new();
        while !self.eat_punct(')') {
            params.push(self.expect_ident()?);
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }
        self.expect_punct('{')?;
        self.enter()?;
        let mut body = Vec::new();
        while !self.eat_punct('}') {
            if self.at(&Token::Eof) {
                self.leave();
                return Err(self.unexpected("`}`"));
            }
            if self.eat_punct(';') {
                continue;
            }
            match self.statement(true) {
                Ok(stmt) => body.push(stmt),
                Err(e) => {
                    self.leave();
                    return Err(e);
                }
            }
        }
        self.leave();
        Ok(Expr::Function(Box::new(Function { params, body })))
    }
}

fn into_target(expr: Expr) -> Option<Target> {
    let mut path = Vec::new();
    let mut cur = expr;
    loop {
        match cur {
            Expr::Ident(root) => {
                path.reverse();
                return Some(Target { root, path });
            }
            Expr::Member(obj, key) => {
                path.push(*key);
                cur = *obj;
            }
            _ => return None,
        }
    }
}

/// JS numbers as JSON: integral values become integers, non-finite ones null.
fn number(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else {
                s.parse().unwrap_or(f64::NAN)
            }
        }
        _ => f64::NAN,
    }
}

/// JavaScript loose truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn property_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn get_member(base: &Value, key: &Value) -> Result<Value, SandboxError> {
    let name = property_key(key);
    Ok(match base {
        Value::Null => {
            return Err(SandboxError::Type(format!(
                "cannot read property `{}` of null or undefined",
                name
            )))
        }
        Value::Object(map) => map.get(&name).cloned().unwrap_or(Value::Null),
        Value::Array(items) if name == "length" => Value::from(items.len()),
        Value::Array(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .unwrap_or(Value::Null),
        Value::String(s) if name == "length" => Value::from(s.encode_utf16().count()),
        _ => Value::Null,
    })
}

fn set_member(base: &mut Value, key: &Value, value: Value) -> Result<(), SandboxError> {
    let name = property_key(key);
    match base {
        Value::Object(map) => {
            map.insert(name, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = name.parse::<usize>().map_err(|_| {
                SandboxError::Unsupported(format!("array property assignment `{}`", name))
            })?;
            if index > items.len() + 65_536 {
                return Err(SandboxError::Unsupported("sparse array assignment".into()));
            }
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            items[index] = value;
            Ok(())
        }
        Value::Null => Err(SandboxError::Type(format!(
            "cannot set property `{}` of null or undefined",
            name
        ))),
        _ => Err(SandboxError::Unsupported(format!(
            "property assignment `{}` on a primitive",
            name
        ))),
    }
}

fn child_mut<'v>(base: &'v mut Value, key: &Value) -> Result<&'v mut Value, SandboxError> {
    let name = property_key(key);
    let slot = match base {
        Value::Object(map) => map.get_mut(&name),
        Value::Array(items) => name.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    };
    slot.ok_or_else(|| SandboxError::Type(format!("cannot set a property below missing `{}`", name)))
}

enum Flow {
    Continue,
    Return(Value),
}

/// Tree-walking evaluator. `frames[0]` is the placeholder global scope.
pub struct Interpreter {
    frames: Vec<BTreeMap<String, Value>>,
    budget: Budget,
}

impl Interpreter {
    pub fn new(globals: BTreeMap<String, Value>, budget: Budget) -> Self {
        Self {
            frames: vec![globals],
            budget,
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.frames.first().and_then(|g| g.get(name))
    }

    pub fn run_program(&mut self, statements: &[Stmt]) -> Result<(), SandboxError> {
        for stmt in statements {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Value, SandboxError> {
        if let Some(value) = self.frames.iter().rev().find_map(|f| f.get(name)) {
            return Ok(value.clone());
        }
        match name {
            "undefined" | "NaN" | "Infinity" => Ok(Value::Null),
            _ => Err(SandboxError::UnknownIdentifier(name.to_string())),
        }
    }

    fn binding_mut(&mut self, name: &str) -> Result<&mut Value, SandboxError> {
        self.frames
            .iter_mut()
            .rev()
            .find_map(|f| f.get_mut(name))
            .ok_or_else(|| SandboxError::UnknownIdentifier(name.to_string()))
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, SandboxError> {
        self.budget.check_deadline()?;
        match stmt {
            Stmt::Declare(bindings) => {
                for (name, init) in bindings {
                    let value = match init {
                        Some(e) => self.eval(e, 0)?,
                        None => Value::Null,
                    };
                    if let Some(frame) = self.frames.last_mut() {
                        frame.insert(name.clone(), value);
                    }
                }
            }
            Stmt::Assign(target, value) => {
                let value = self.eval(value, 0)?;
                let keys = target
                    .path
                    .iter()
                    .map(|k| self.eval(k, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut slot = self.binding_mut(&target.root)?;
                match keys.split_last() {
                    None => *slot = value,
                    Some((last, parents)) => {
                        for key in parents {
                            slot = child_mut(slot, key)?;
                        }
                        set_member(slot, last, value)?;
                    }
                }
            }
            Stmt::Expr(e) => {
                self.eval(e, 0)?;
            }
            Stmt::Return(e) => {
                let value = match e {
                    Some(e) => self.eval(e, 0)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Continue)
    }

    fn eval(&mut self, expr: &Expr, depth: usize) -> Result<Value, SandboxError> {
        self.budget.check_depth(depth)?;
        self.budget.check_deadline()?;
        let depth = depth + 1;
        Ok(match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Undefined => Value::Null,
            Expr::Ident(name) => self.lookup(name)?,
            Expr::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|i| self.eval(i, depth))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Object(props) => {
                let mut map = Map::new();
                for (key, value) in props {
                    let value = self.eval(value, depth)?;
                    map.insert(key.clone(), value);
                }
                Value::Object(map)
            }
            Expr::Member(obj, key) => {
                let base = self.eval(obj, depth)?;
                let key = self.eval(key, depth)?;
                get_member(&base, &key)?
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand, depth)?;
                match op {
                    UnaryOp::Not => Value::Bool(!truthy(&v)),
                    UnaryOp::Neg => number(-to_number(&v)),
                    UnaryOp::Plus => number(to_number(&v)),
                    UnaryOp::Void => Value::Null,
                }
            }
            Expr::Function(_) => {
                return Err(SandboxError::Unsupported(
                    "function values other than immediate invocations".into(),
                ))
            }
            Expr::Call(func, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, depth))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(func, args)?
            }
        })
    }

    fn call(&mut self, func: &Function, args: Vec<Value>) -> Result<Value, SandboxError> {
        self.budget.check_depth(self.frames.len())?;
        let mut args = args.into_iter();
        let frame: BTreeMap<String, Value> = func
            .params
            .iter()
            .map(|p| (p.clone(), args.next().unwrap_or(Value::Null)))
            .collect();
        self.frames.push(frame);
        let mut result = Ok(Value::Null);
        for stmt in &func.body {
            match self.exec(stmt) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => {
                    result = Ok(value);
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.frames.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn run(src: &str) -> Result<Value, SandboxError> {
        let budget = Budget::new(Duration::from_secs(5));
        let tokens = tokenize(src, &budget)?;
        let program = Parser::new(&tokens, budget).parse_program()?;
        let mut globals = BTreeMap::new();
        globals.insert("out".to_string(), json!({}));
        let mut interp = Interpreter::new(globals, budget);
        interp.run_program(&program)?;
        Ok(interp.global("out").cloned().unwrap_or(Value::Null))
    }

    #[test]
    fn integral_numbers_stay_integers() {
        assert_eq!(number(3.0), json!(3));
        assert_eq!(number(-0.25), json!(-0.25));
        assert_eq!(number(f64::NAN), Value::Null);
        assert_eq!(number(1e300), json!(1e300));
    }

    #[test]
    fn js_truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!(false)));
        assert!(truthy(&json!("false")));
        assert!(truthy(&json!("0")));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!({})));
    }

    #[test]
    fn var_declarations_and_shorthand_properties() {
        let out = run("var a = 1, b; out.v = (function(){ var c = 'x'; return {a: a, b, c} }());").unwrap();
        assert_eq!(out, json!({"v": {"a": 1, "b": null, "c": "x"}}));
    }

    #[test]
    fn quoted_and_numeric_keys() {
        let out = run(r#"out.v = {"a-b": 1, 2: "two", 1.5: 3};"#).unwrap();
        assert_eq!(out, json!({"v": {"a-b": 1, "2": "two", "1.5": 3}}));
    }

    #[test]
    fn member_reads() {
        let out = run("out.v = [[1,2,3].length, 'ab'.length, {k:[5,6]}.k[1], {}['missing']];").unwrap();
        assert_eq!(out, json!({"v": [3, 2, 6, null]}));
    }

    #[test]
    fn holes_and_trailing_commas() {
        let out = run("out.v = [,1,,2,];").unwrap();
        assert_eq!(out, json!({"v": [null, 1, null, 2]}));
    }

    #[test]
    fn named_function_expression() {
        let out = run("out.v = (function named(x){return x}(7));").unwrap();
        assert_eq!(out, json!({"v": 7}));
    }

    #[test]
    fn inner_scope_sees_outer_parameters() {
        let out = run("out.v = (function(a){return (function(b){return a})(2)}(1));").unwrap();
        assert_eq!(out, json!({"v": 1}));
    }

    #[test]
    fn parameters_shadow_placeholders() {
        let out = run("out.v = (function(out){out.x = 1; return out}({}));").unwrap();
        assert_eq!(out, json!({"v": {"x": 1}}));
    }

    #[test]
    fn nested_member_assignment_requires_existing_parent() {
        assert!(matches!(run("out.a.b = 1;"), Err(SandboxError::Type(_))));
        assert_eq!(run("out.a = {}; out.a.b = 1;").unwrap(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn return_at_top_level_is_a_syntax_error() {
        assert!(matches!(run("return 1;"), Err(SandboxError::Syntax { .. })));
    }

    #[test]
    fn bare_function_value_is_rejected() {
        assert!(matches!(
            run("out.v = function(){};"),
            Err(SandboxError::Unsupported(_))
        ));
    }

    #[test]
    fn assignment_to_literal_is_rejected() {
        assert!(matches!(run("1 = 2;"), Err(SandboxError::Unsupported(_))));
    }

    #[test]
    fn unary_operators() {
        let out = run("out.v = [!0, !'', -'3', +true, -(-2), void 'x'];").unwrap();
        assert_eq!(out, json!({"v": [true, true, -3, 1, 2, null]}));
    }
}
