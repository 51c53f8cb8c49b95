//! Built-in expression-script engine. Small on purpose: enough surface to
//! drive every protocol path end to end (persistent state, named
//! callables, modules with members, console output, deferred results)
//! without pulling a full language runtime into the worker.
//!
//! Statements are separated by newlines or `;`; the value of a run is the
//! value of its last statement. `later <expr>` evaluates on a background
//! thread and resolves as a deferred result; a function declared
//! `fn name(a) later <expr>` does the same when invoked.

use std::collections::HashMap;
use std::thread;

use serde_json::{Number, Value};
use tokio::sync::oneshot;

use crate::engine::{
    ConsoleChannel, ConsoleMode, ConsoleSink, DeferredOutcome, Engine, EngineError, EngineFactory,
    EngineObject, ModuleEngine, Outcome,
};

pub struct ExprFactory;

impl EngineFactory for ExprFactory {
    fn create_plain(&self, _options: Option<&Value>) -> Result<Box<dyn Engine>, EngineError> {
        Ok(Box::new(ExprEngine::new(ConsoleTarget::Inherit)))
    }

    fn create_module(
        &self,
        _options: Option<&Value>,
        console: ConsoleMode,
    ) -> Result<Box<dyn ModuleEngine>, EngineError> {
        let target = if console.routes_console() {
            ConsoleTarget::Inherit
        } else {
            ConsoleTarget::Off
        };
        Ok(Box::new(ExprModuleEngine { console: target }))
    }
}

pub struct ExprEngine {
    env: Env,
    console: ConsoleTarget,
}

impl ExprEngine {
    fn new(console: ConsoleTarget) -> Self {
        Self {
            env: Env::new(),
            console,
        }
    }
}

impl Engine for ExprEngine {
    fn run(&mut self, code: &str) -> Result<Outcome, EngineError> {
        let program = parse_program(code)?;
        match exec_program(&program, &mut self.env, &self.console)? {
            RunValue::Slot(slot) => Ok(Outcome::Value(slot_to_value(&slot))),
            RunValue::Deferred(receiver) => Ok(Outcome::Deferred(receiver)),
        }
    }

    fn call(&mut self, function_name: &str, args: &[Value]) -> Result<Outcome, EngineError> {
        let expr = parse_expression(function_name)?;
        match eval_expr(&expr, &self.env, &self.console)? {
            Slot::Func(def) => invoke_function(&def, args, &self.env, &self.console),
            Slot::Data(_) => Err(EngineError::new(format!(
                "{function_name} is not a function"
            ))),
        }
    }
}

pub struct ExprModuleEngine {
    console: ConsoleTarget,
}

impl ModuleEngine for ExprModuleEngine {
    fn load(
        &mut self,
        code: &str,
        filename: Option<&str>,
    ) -> Result<Box<dyn EngineObject>, EngineError> {
        let program = parse_program(code).map_err(|err| match filename {
            Some(filename) => EngineError::new(format!("{filename}: {err}")),
            None => err,
        })?;
        let mut env = Env::new();
        let exported = match exec_program(&program, &mut env, &self.console)? {
            RunValue::Slot(slot) => slot,
            // A trailing `later` runs fire-and-forget; the module itself
            // exports nothing.
            RunValue::Deferred(_) => Slot::Data(Value::Null),
        };
        Ok(Box::new(ExprModule {
            bindings: env,
            exported,
            console: self.console.clone(),
        }))
    }

    fn subscribe_console(&mut self, sink: ConsoleSink) {
        self.console = ConsoleTarget::Sink(sink);
    }
}

struct ExprModule {
    bindings: Env,
    exported: Slot,
    console: ConsoleTarget,
}

impl EngineObject for ExprModule {
    fn value(&self) -> Result<Value, EngineError> {
        Ok(slot_to_value(&self.exported))
    }

    fn invoke(&self, args: &[Value]) -> Result<Outcome, EngineError> {
        match &self.exported {
            Slot::Func(def) => invoke_function(def, args, &self.bindings, &self.console),
            Slot::Data(_) => Err(EngineError::new("module is not callable")),
        }
    }

    fn member(&self, name: &str) -> Result<Outcome, EngineError> {
        let value = self
            .bindings
            .get(name)
            .map(slot_to_value)
            .unwrap_or(Value::Null);
        Ok(Outcome::Value(value))
    }

    fn invoke_member(&self, name: &str, args: &[Value]) -> Result<Outcome, EngineError> {
        match self.bindings.get(name) {
            Some(Slot::Func(def)) => invoke_function(def, args, &self.bindings, &self.console),
            _ => Err(EngineError::new(format!("{name} is not a function"))),
        }
    }
}

type Env = HashMap<String, Slot>;

#[derive(Debug, Clone)]
enum Slot {
    Data(Value),
    Func(FuncDef),
}

#[derive(Debug, Clone)]
struct FuncDef {
    name: String,
    params: Vec<String>,
    body: Expr,
    deferred: bool,
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(String, Expr),
    FnDef(FuncDef),
    Expr(Expr),
    Later(Expr),
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Var(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

#[derive(Clone)]
enum ConsoleTarget {
    Inherit,
    Off,
    Sink(ConsoleSink),
}

impl ConsoleTarget {
    fn emit(&self, channel: ConsoleChannel, args: &[String]) {
        match self {
            ConsoleTarget::Inherit => eprintln!("{}", args.join(" ")),
            ConsoleTarget::Off => {}
            ConsoleTarget::Sink(sink) => sink.emit(channel, args),
        }
    }
}

enum RunValue {
    Slot(Slot),
    Deferred(DeferredOutcome),
}

fn exec_program(
    program: &[Stmt],
    env: &mut Env,
    console: &ConsoleTarget,
) -> Result<RunValue, EngineError> {
    let mut last = RunValue::Slot(Slot::Data(Value::Null));
    for stmt in program {
        last = match stmt {
            Stmt::Assign(name, expr) => {
                let slot = eval_expr(expr, env, console)?;
                env.insert(name.clone(), slot.clone());
                RunValue::Slot(slot)
            }
            Stmt::FnDef(def) => {
                env.insert(def.name.clone(), Slot::Func(def.clone()));
                RunValue::Slot(Slot::Func(def.clone()))
            }
            Stmt::Expr(expr) => RunValue::Slot(eval_expr(expr, env, console)?),
            Stmt::Later(expr) => RunValue::Deferred(spawn_deferred(
                expr.clone(),
                env.clone(),
                console.clone(),
            )),
        };
    }
    Ok(last)
}

fn spawn_deferred(expr: Expr, env: Env, console: ConsoleTarget) -> DeferredOutcome {
    let (tx, rx) = oneshot::channel();
    thread::spawn(move || {
        let result = eval_expr(&expr, &env, &console).map(|slot| slot_to_value(&slot));
        let _ = tx.send(result);
    });
    rx
}

fn invoke_function(
    def: &FuncDef,
    args: &[Value],
    env: &Env,
    console: &ConsoleTarget,
) -> Result<Outcome, EngineError> {
    let scope = bind_params(def, args, env)?;
    if def.deferred {
        Ok(Outcome::Deferred(spawn_deferred(
            def.body.clone(),
            scope,
            console.clone(),
        )))
    } else {
        let slot = eval_expr(&def.body, &scope, console)?;
        Ok(Outcome::Value(slot_to_value(&slot)))
    }
}

fn bind_params(def: &FuncDef, args: &[Value], env: &Env) -> Result<Env, EngineError> {
    if args.len() != def.params.len() {
        return Err(EngineError::new(format!(
            "{} expects {} arguments, got {}",
            def.name,
            def.params.len(),
            args.len()
        )));
    }
    let mut scope = env.clone();
    for (param, arg) in def.params.iter().zip(args) {
        scope.insert(param.clone(), Slot::Data(arg.clone()));
    }
    Ok(scope)
}

fn eval_expr(expr: &Expr, env: &Env, console: &ConsoleTarget) -> Result<Slot, EngineError> {
    match expr {
        Expr::Literal(value) => Ok(Slot::Data(value.clone())),
        Expr::Var(name) => env
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::new(format!("{name} is not defined"))),
        Expr::Neg(inner) => {
            let slot = eval_expr(inner, env, console)?;
            match slot {
                Slot::Data(Value::Number(number)) => {
                    if let Some(int) = number.as_i64() {
                        let negated = int
                            .checked_neg()
                            .ok_or_else(|| EngineError::new("integer overflow"))?;
                        Ok(Slot::Data(Value::from(negated)))
                    } else {
                        float_value(-number.as_f64().unwrap_or(0.0))
                    }
                }
                other => Err(EngineError::new(format!(
                    "cannot negate {}",
                    slot_type_name(&other)
                ))),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, env, console)?;
            let rhs = eval_expr(rhs, env, console)?;
            eval_binary(*op, &lhs, &rhs)
        }
        Expr::Call(name, args) => eval_call(name, args, env, console),
    }
}

fn eval_call(
    name: &str,
    args: &[Expr],
    env: &Env,
    console: &ConsoleTarget,
) -> Result<Slot, EngineError> {
    match name {
        "log" | "warn" => {
            let mut rendered = Vec::with_capacity(args.len());
            for arg in args {
                rendered.push(slot_display(&eval_expr(arg, env, console)?));
            }
            let channel = if name == "log" {
                ConsoleChannel::Output
            } else {
                ConsoleChannel::ErrorOutput
            };
            console.emit(channel, &rendered);
            Ok(Slot::Data(Value::Null))
        }
        "fail" => {
            let message = match args {
                [arg] => slot_display(&eval_expr(arg, env, console)?),
                _ => {
                    return Err(EngineError::new(format!(
                        "fail expects 1 arguments, got {}",
                        args.len()
                    )));
                }
            };
            Err(EngineError::new(message))
        }
        _ => {
            let def = match env.get(name) {
                Some(Slot::Func(def)) => def.clone(),
                Some(Slot::Data(_)) => {
                    return Err(EngineError::new(format!("{name} is not a function")));
                }
                None => return Err(EngineError::new(format!("{name} is not defined"))),
            };
            if def.deferred {
                return Err(EngineError::new(format!(
                    "{name} is deferred and can only be called directly"
                )));
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(slot_to_value(&eval_expr(arg, env, console)?));
            }
            let scope = bind_params(&def, &values, env)?;
            eval_expr(&def.body, &scope, console)
        }
    }
}

fn eval_binary(op: BinOp, lhs: &Slot, rhs: &Slot) -> Result<Slot, EngineError> {
    match op {
        BinOp::Eq => Ok(Slot::Data(Value::Bool(slots_equal(lhs, rhs)?))),
        BinOp::Ne => Ok(Slot::Data(Value::Bool(!slots_equal(lhs, rhs)?))),
        BinOp::Add => {
            if let (Slot::Data(left), Slot::Data(right)) = (lhs, rhs)
                && (left.is_string() || right.is_string())
            {
                return Ok(Slot::Data(Value::from(format!(
                    "{}{}",
                    value_display(left),
                    value_display(right)
                ))));
            }
            numeric_binary(op, lhs, rhs)
        }
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => numeric_binary(op, lhs, rhs),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => ordered_binary(op, lhs, rhs),
    }
}

fn slots_equal(lhs: &Slot, rhs: &Slot) -> Result<bool, EngineError> {
    match (lhs, rhs) {
        (Slot::Data(left), Slot::Data(right)) => Ok(left == right),
        _ => Err(EngineError::new("cannot compare a function")),
    }
}

fn numeric_binary(op: BinOp, lhs: &Slot, rhs: &Slot) -> Result<Slot, EngineError> {
    let (left, right) = numeric_operands(op, lhs, rhs)?;
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        return int_binary(op, l, r);
    }
    let l = left.as_f64().unwrap_or(0.0);
    let r = right.as_f64().unwrap_or(0.0);
    match op {
        BinOp::Add => float_value(l + r),
        BinOp::Sub => float_value(l - r),
        BinOp::Mul => float_value(l * r),
        BinOp::Div => {
            if r == 0.0 {
                Err(EngineError::new("division by zero"))
            } else {
                float_value(l / r)
            }
        }
        BinOp::Rem => {
            if r == 0.0 {
                Err(EngineError::new("division by zero"))
            } else {
                float_value(l % r)
            }
        }
        _ => unreachable!("non-arithmetic operator in numeric_binary"),
    }
}

fn int_binary(op: BinOp, l: i64, r: i64) -> Result<Slot, EngineError> {
    let overflow = || EngineError::new("integer overflow");
    match op {
        BinOp::Add => Ok(int_value(l.checked_add(r).ok_or_else(overflow)?)),
        BinOp::Sub => Ok(int_value(l.checked_sub(r).ok_or_else(overflow)?)),
        BinOp::Mul => Ok(int_value(l.checked_mul(r).ok_or_else(overflow)?)),
        BinOp::Div => {
            if r == 0 {
                Err(EngineError::new("division by zero"))
            } else if l % r == 0 {
                Ok(int_value(l / r))
            } else {
                float_value(l as f64 / r as f64)
            }
        }
        BinOp::Rem => {
            if r == 0 {
                Err(EngineError::new("division by zero"))
            } else {
                Ok(int_value(l % r))
            }
        }
        _ => unreachable!("non-arithmetic operator in int_binary"),
    }
}

fn ordered_binary(op: BinOp, lhs: &Slot, rhs: &Slot) -> Result<Slot, EngineError> {
    let result = match (lhs, rhs) {
        (Slot::Data(Value::Number(left)), Slot::Data(Value::Number(right))) => {
            let l = left.as_f64().unwrap_or(0.0);
            let r = right.as_f64().unwrap_or(0.0);
            match op {
                BinOp::Lt => l < r,
                BinOp::Le => l <= r,
                BinOp::Gt => l > r,
                BinOp::Ge => l >= r,
                _ => unreachable!("non-ordering operator in ordered_binary"),
            }
        }
        (Slot::Data(Value::String(l)), Slot::Data(Value::String(r))) => match op {
            BinOp::Lt => l < r,
            BinOp::Le => l <= r,
            BinOp::Gt => l > r,
            BinOp::Ge => l >= r,
            _ => unreachable!("non-ordering operator in ordered_binary"),
        },
        _ => {
            return Err(EngineError::new(format!(
                "cannot apply `{}` to {} and {}",
                op.symbol(),
                slot_type_name(lhs),
                slot_type_name(rhs)
            )));
        }
    };
    Ok(Slot::Data(Value::Bool(result)))
}

fn numeric_operands<'a>(
    op: BinOp,
    lhs: &'a Slot,
    rhs: &'a Slot,
) -> Result<(&'a Number, &'a Number), EngineError> {
    match (lhs, rhs) {
        (Slot::Data(Value::Number(left)), Slot::Data(Value::Number(right))) => Ok((left, right)),
        _ => Err(EngineError::new(format!(
            "cannot apply `{}` to {} and {}",
            op.symbol(),
            slot_type_name(lhs),
            slot_type_name(rhs)
        ))),
    }
}

fn int_value(value: i64) -> Slot {
    Slot::Data(Value::from(value))
}

fn float_value(value: f64) -> Result<Slot, EngineError> {
    Number::from_f64(value)
        .map(|number| Slot::Data(Value::Number(number)))
        .ok_or_else(|| EngineError::new("result is not a finite number"))
}

fn slot_to_value(slot: &Slot) -> Value {
    match slot {
        Slot::Data(value) => value.clone(),
        // Functions have no JSON form.
        Slot::Func(_) => Value::Null,
    }
}

fn slot_display(slot: &Slot) -> String {
    match slot {
        Slot::Data(value) => value_display(value),
        Slot::Func(def) => format!("<fn {}>", def.name),
    }
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn slot_type_name(slot: &Slot) -> &'static str {
    match slot {
        Slot::Func(_) => "function",
        Slot::Data(Value::Null) => "null",
        Slot::Data(Value::Bool(_)) => "boolean",
        Slot::Data(Value::Number(_)) => "number",
        Slot::Data(Value::String(_)) => "string",
        Slot::Data(Value::Array(_)) => "array",
        Slot::Data(Value::Object(_)) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Fn,
    Later,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    Comma,
    Sep,
}

fn tokenize(src: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' | ';' => {
                chars.next();
                tokens.push(Token::Sep);
            }
            '0'..='9' => tokens.push(lex_number(&mut chars)?),
            '"' => tokens.push(lex_string(&mut chars)?),
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "fn" => Token::Fn,
                    "later" => Token::Later,
                    _ => Token::Ident(ident),
                });
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::EqEq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    return Err(EngineError::new("unexpected character `!`"));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            other => {
                return Err(EngineError::new(format!("unexpected character `{other}`")));
            }
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Token, EngineError> {
    let mut text = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if chars.peek() == Some(&'.') {
        text.push('.');
        chars.next();
        let mut saw_digit = false;
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                chars.next();
                saw_digit = true;
            } else {
                break;
            }
        }
        if !saw_digit {
            return Err(EngineError::new(format!("malformed number `{text}`")));
        }
        text.parse::<f64>()
            .map(Token::Float)
            .map_err(|_| EngineError::new(format!("malformed number `{text}`")))
    } else {
        text.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| EngineError::new(format!("number literal too large `{text}`")))
    }
}

fn lex_string(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<Token, EngineError> {
    chars.next();
    let mut text = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(Token::Str(text)),
            Some('\\') => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('\\') => text.push('\\'),
                Some('"') => text.push('"'),
                Some(other) => {
                    return Err(EngineError::new(format!("unknown escape `\\{other}`")));
                }
                None => return Err(EngineError::new("unterminated string literal")),
            },
            Some(other) => text.push(other),
            None => return Err(EngineError::new("unterminated string literal")),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn parse_program(src: &str) -> Result<Vec<Stmt>, EngineError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let mut program = Vec::new();
    loop {
        while parser.peek() == Some(&Token::Sep) {
            parser.next();
        }
        if parser.peek().is_none() {
            break;
        }
        program.push(parser.parse_stmt()?);
        match parser.peek() {
            Some(&Token::Sep) | None => {}
            Some(other) => {
                return Err(EngineError::new(format!(
                    "unexpected token {}",
                    token_display(other)
                )));
            }
        }
    }
    Ok(program)
}

fn parse_expression(src: &str) -> Result<Expr, EngineError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(other) => Err(EngineError::new(format!(
            "unexpected token {}",
            token_display(other)
        ))),
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), EngineError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(EngineError::new(format!(
                "expected {}, found {}",
                token_display(&token),
                token_display(&found)
            ))),
            None => Err(EngineError::new(format!(
                "expected {}, found end of input",
                token_display(&token)
            ))),
        }
    }

    fn expect_ident(&mut self) -> Result<String, EngineError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(other) => Err(EngineError::new(format!(
                "expected a name, found {}",
                token_display(&other)
            ))),
            None => Err(EngineError::new("expected a name, found end of input")),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, EngineError> {
        match self.peek() {
            Some(Token::Fn) => self.parse_fn_def(),
            Some(Token::Later) => {
                self.next();
                Ok(Stmt::Later(self.parse_expr()?))
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::Assign) => {
                let name = self.expect_ident()?;
                self.expect(Token::Assign)?;
                Ok(Stmt::Assign(name, self.parse_expr()?))
            }
            _ => Ok(Stmt::Expr(self.parse_expr()?)),
        }
    }

    fn parse_fn_def(&mut self) -> Result<Stmt, EngineError> {
        self.expect(Token::Fn)?;
        let name = self.expect_ident()?;
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                params.push(self.expect_ident()?);
                match self.peek() {
                    Some(&Token::Comma) => {
                        self.next();
                    }
                    _ => break,
                }
            }
        }
        self.expect(Token::RParen)?;
        let deferred = if self.peek() == Some(&Token::Later) {
            self.next();
            true
        } else {
            false
        };
        let body = self.parse_expr()?;
        Ok(Stmt::FnDef(FuncDef {
            name,
            params,
            body,
            deferred,
        }))
    }

    fn parse_expr(&mut self) -> Result<Expr, EngineError> {
        let mut expr = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(&Token::EqEq) => BinOp::Eq,
                Some(&Token::NotEq) => BinOp::Ne,
                Some(&Token::Lt) => BinOp::Lt,
                Some(&Token::Le) => BinOp::Le,
                Some(&Token::Gt) => BinOp::Gt,
                Some(&Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.next();
            let rhs = self.parse_additive()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_additive(&mut self) -> Result<Expr, EngineError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(&Token::Plus) => BinOp::Add,
                Some(&Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, EngineError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(&Token::Star) => BinOp::Mul,
                Some(&Token::Slash) => BinOp::Div,
                Some(&Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, EngineError> {
        if self.peek() == Some(&Token::Minus) {
            self.next();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Literal(Value::from(value))),
            Some(Token::Float(value)) => {
                Number::from_f64(value)
                    .map(|number| Expr::Literal(Value::Number(number)))
                    .ok_or_else(|| EngineError::new("malformed number"))
            }
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::from(text))),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let mut args = Vec::new();
                        if self.peek() != Some(&Token::RParen) {
                            loop {
                                args.push(self.parse_expr()?);
                                match self.peek() {
                                    Some(&Token::Comma) => {
                                        self.next();
                                    }
                                    _ => break,
                                }
                            }
                        }
                        self.expect(Token::RParen)?;
                        Ok(Expr::Call(name, args))
                    } else {
                        Ok(Expr::Var(name))
                    }
                }
            },
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(other) => Err(EngineError::new(format!(
                "unexpected token {}",
                token_display(&other)
            ))),
            None => Err(EngineError::new("unexpected end of input")),
        }
    }
}

fn token_display(token: &Token) -> String {
    match token {
        Token::Int(value) => format!("`{value}`"),
        Token::Float(value) => format!("`{value}`"),
        Token::Str(_) => "a string".to_string(),
        Token::Ident(name) => format!("`{name}`"),
        Token::Fn => "`fn`".to_string(),
        Token::Later => "`later`".to_string(),
        Token::Plus => "`+`".to_string(),
        Token::Minus => "`-`".to_string(),
        Token::Star => "`*`".to_string(),
        Token::Slash => "`/`".to_string(),
        Token::Percent => "`%`".to_string(),
        Token::EqEq => "`==`".to_string(),
        Token::NotEq => "`!=`".to_string(),
        Token::Lt => "`<`".to_string(),
        Token::Le => "`<=`".to_string(),
        Token::Gt => "`>`".to_string(),
        Token::Ge => "`>=`".to_string(),
        Token::Assign => "`=`".to_string(),
        Token::LParen => "`(`".to_string(),
        Token::RParen => "`)`".to_string(),
        Token::Comma => "`,`".to_string(),
        Token::Sep => "end of statement".to_string(),
    }
}
