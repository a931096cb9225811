//! # parse
//!
//! Front end for the analyzed pthread C subset.
//! Produces an [`Ast`]: the global mutex declarations plus one statement tree
//! per function definition. Constructs the analysis does not model
//! (arithmetic, pointers, declarations, unknown externs) are parsed
//! superficially and kept as [`StmtKind::Nop`]-like statements so control flow
//! stays intact. Malformed input is a fatal [`ParseError`] naming the failure
//! location.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use once_cell::sync::Lazy;

/// A line/column position in the analyzed source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub span: Span,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at {}: {}", self.span, self.message)
    }
}

impl Error for ParseError {}

#[derive(Debug)]
pub struct Ast {
    pub locks: Vec<LockDecl>,
    pub functions: Vec<FunctionDef>,
}

/// A global `pthread_mutex_t` object declaration.
#[derive(Debug)]
pub struct LockDecl {
    pub name: String,
    pub span: Span,
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub span: Span,
    pub body: Vec<Stmt>,
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug)]
pub enum StmtKind {
    /// `pthread_mutex_lock(&name)`
    Lock(String),
    /// `pthread_mutex_unlock(&name)`
    Unlock(String),
    /// `pthread_create(&t, attr, entry, arg)`
    ThreadCreate { entry: String },
    /// A call to a function that is not a modeled pthread API. Resolved
    /// against the program's own definitions during CFG lowering.
    Call { callee: String },
    /// `asm`/`__asm__` with the names occurring in its output and clobber
    /// operand lists. Interpreted only through the configured opaque policy.
    Asm { operands: Vec<String> },
    /// `return`, `pthread_exit`, `exit`: terminates the current path.
    Return,
    If { then_body: Vec<Stmt>, else_body: Vec<Stmt> },
    While { body: Vec<Stmt> },
    Block(Vec<Stmt>),
    /// Declarations, assignments, unknown expression statements.
    Nop,
}

/// The pthread/libc calls the analysis interprets specially. Everything else
/// is either a program-defined function or an extern treated as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownApi {
    MutexLock,
    MutexUnlock,
    MutexInit,
    ThreadCreate,
    ThreadJoin,
    ThreadExit,
    Exit,
}

static KNOWN_API: Lazy<HashMap<&'static str, KnownApi>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("pthread_mutex_lock", KnownApi::MutexLock);
    m.insert("pthread_mutex_unlock", KnownApi::MutexUnlock);
    m.insert("pthread_mutex_init", KnownApi::MutexInit);
    m.insert("pthread_mutex_destroy", KnownApi::MutexInit);
    m.insert("pthread_create", KnownApi::ThreadCreate);
    m.insert("pthread_join", KnownApi::ThreadJoin);
    m.insert("pthread_exit", KnownApi::ThreadExit);
    m.insert("exit", KnownApi::Exit);
    m
});

fn is_type_word(s: &str) -> bool {
    matches!(
        s,
        "void"
            | "int"
            | "char"
            | "long"
            | "short"
            | "float"
            | "double"
            | "unsigned"
            | "signed"
            | "size_t"
            | "struct"
            | "union"
            | "enum"
            | "const"
            | "static"
            | "extern"
            | "volatile"
            | "register"
            | "pthread_t"
            | "pthread_attr_t"
            | "pthread_mutex_t"
            | "pthread_mutexattr_t"
            | "pthread_cond_t"
    )
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    Num(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    span: Span,
}

fn lex(source: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let mut line: u32 = 1;
    let mut col: u32 = 1;
    while i < chars.len() {
        let c = chars[i];
        let span = Span { line, col };
        match c {
            '\n' => {
                i += 1;
                line += 1;
                col = 1;
            }
            _ if c.is_whitespace() => {
                i += 1;
                col += 1;
            }
            // preprocessor line
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                col += 2;
                loop {
                    if i + 1 >= chars.len() {
                        return Err(ParseError {
                            span,
                            message: "unterminated block comment".into(),
                        });
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        col += 2;
                        break;
                    }
                    if chars[i] == '\n' {
                        line += 1;
                        col = 1;
                    } else {
                        col += 1;
                    }
                    i += 1;
                }
            }
            '"' => {
                i += 1;
                col += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(ParseError {
                                span,
                                message: "unterminated string literal".into(),
                            })
                        }
                        Some('"') => {
                            i += 1;
                            col += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&esc) = chars.get(i + 1) {
                                s.push(esc);
                            }
                            i += 2;
                            col += 2;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                            col += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Str(s),
                    span,
                });
            }
            '\'' => {
                i += 1;
                col += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(ParseError {
                                span,
                                message: "unterminated character literal".into(),
                            })
                        }
                        Some('\'') => {
                            i += 1;
                            col += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&esc) = chars.get(i + 1) {
                                s.push(esc);
                            }
                            i += 2;
                            col += 2;
                        }
                        Some(&other) => {
                            s.push(other);
                            i += 1;
                            col += 1;
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Num(s),
                    span,
                });
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    s.push(chars[i]);
                    i += 1;
                    col += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Ident(s),
                    span,
                });
            }
            _ if c.is_ascii_digit() => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    s.push(chars[i]);
                    i += 1;
                    col += 1;
                }
                tokens.push(Token {
                    kind: TokenKind::Num(s),
                    span,
                });
            }
            _ => {
                tokens.push(Token {
                    kind: TokenKind::Punct(c),
                    span,
                });
                i += 1;
                col += 1;
            }
        }
    }
    Ok(tokens)
}

pub fn parse(source: &str) -> Result<Ast, ParseError> {
    let tokens = lex(source)?;
    Parser::new(tokens).parse_translation_unit()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    eof: Span,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        let eof = tokens.last().map(|t| t.span).unwrap_or_default();
        Self {
            tokens,
            pos: 0,
            eof,
        }
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_nth(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.pos + n).map(|t| &t.kind)
    }

    fn peek_is_punct(&self, c: char) -> bool {
        matches!(self.peek(), Some(TokenKind::Punct(p)) if *p == c)
    }

    fn span(&self) -> Span {
        self.tokens.get(self.pos).map(|t| t.span).unwrap_or(self.eof)
    }

    fn bump(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek_is_punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(TokenKind::Ident(s)) if s == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn err<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            span: self.span(),
            message: message.into(),
        })
    }

    fn expect_punct(&mut self, c: char) -> Result<Span, ParseError> {
        let span = self.span();
        if self.eat_punct(c) {
            Ok(span)
        } else {
            self.err(format!("expected `{}`", c))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Span), ParseError> {
        match self.peek() {
            Some(TokenKind::Ident(s)) => {
                let s = s.clone();
                let span = self.span();
                self.pos += 1;
                Ok((s, span))
            }
            _ => self.err("expected an identifier"),
        }
    }

    fn parse_translation_unit(&mut self) -> Result<Ast, ParseError> {
        let mut ast = Ast {
            locks: Vec::new(),
            functions: Vec::new(),
        };
        while self.peek().is_some() {
            if self.eat_punct(';') {
                continue;
            }
            self.parse_top_level(&mut ast)?;
        }
        Ok(ast)
    }

    fn parse_top_level(&mut self, ast: &mut Ast) -> Result<(), ParseError> {
        let mut saw_type = false;
        let mut base_is_mutex = false;
        let mut is_pointer = false;
        loop {
            match self.peek() {
                Some(TokenKind::Ident(s)) if is_type_word(s) => {
                    if s == "pthread_mutex_t" {
                        base_is_mutex = true;
                    }
                    let is_tag = matches!(s.as_str(), "struct" | "union" | "enum");
                    self.pos += 1;
                    if is_tag {
                        if let Some(TokenKind::Ident(_)) = self.peek() {
                            self.pos += 1;
                        }
                    }
                    saw_type = true;
                }
                Some(TokenKind::Punct('*')) if saw_type => {
                    self.pos += 1;
                    is_pointer = true;
                }
                _ => break,
            }
        }
        if !saw_type {
            return self.err("expected a declaration");
        }
        let (name, name_span) = self.expect_ident()?;
        if self.peek_is_punct('(') {
            self.skip_balanced_parens()?;
            if self.eat_punct(';') {
                // prototype only
                return Ok(());
            }
            self.expect_punct('{')?;
            let body = self.parse_block_rest()?;
            ast.functions.push(FunctionDef {
                name,
                span: name_span,
                body,
            });
            return Ok(());
        }
        // global object declarator list
        if base_is_mutex && !is_pointer {
            ast.locks.push(LockDecl {
                name,
                span: name_span,
            });
        }
        loop {
            match self.peek() {
                Some(TokenKind::Punct(';')) => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(TokenKind::Punct(',')) => {
                    self.pos += 1;
                    let mut ptr_decl = false;
                    while self.eat_punct('*') {
                        ptr_decl = true;
                    }
                    let (n, sp) = self.expect_ident()?;
                    if base_is_mutex && !ptr_decl {
                        ast.locks.push(LockDecl { name: n, span: sp });
                    }
                }
                Some(TokenKind::Punct('=')) => {
                    self.pos += 1;
                    self.skip_initializer()?;
                }
                Some(TokenKind::Punct('[')) => {
                    self.skip_brackets()?;
                }
                Some(_) => return self.err("unexpected token in declaration"),
                None => return self.err("expected `;`"),
            }
        }
    }

    fn parse_block_rest(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            if self.eat_punct('}') {
                return Ok(body);
            }
            if self.peek().is_none() {
                return self.err("unterminated block");
            }
            body.push(self.parse_stmt()?);
        }
    }

    /// Parse a statement and flatten `{ ... }` into the statement list it
    /// wraps, for use as an `if`/`while` body.
    fn parse_stmt_as_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let stmt = self.parse_stmt()?;
        Ok(match stmt.kind {
            StmtKind::Block(body) => body,
            _ => vec![stmt],
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let span = self.span();
        match self.peek() {
            Some(TokenKind::Punct('{')) => {
                self.pos += 1;
                let body = self.parse_block_rest()?;
                Ok(Stmt {
                    kind: StmtKind::Block(body),
                    span,
                })
            }
            Some(TokenKind::Punct(';')) => {
                self.pos += 1;
                Ok(Stmt {
                    kind: StmtKind::Nop,
                    span,
                })
            }
            // expression statements we do not model, e.g. `*p = 0;`, `(void)x;`
            Some(TokenKind::Punct('*')) | Some(TokenKind::Punct('(')) => {
                self.skip_to_semi()?;
                Ok(Stmt {
                    kind: StmtKind::Nop,
                    span,
                })
            }
            Some(TokenKind::Ident(s)) => {
                let name = s.clone();
                match name.as_str() {
                    "if" => {
                        self.pos += 1;
                        self.skip_balanced_parens()?;
                        let then_body = self.parse_stmt_as_body()?;
                        let else_body = if self.eat_ident("else") {
                            self.parse_stmt_as_body()?
                        } else {
                            Vec::new()
                        };
                        Ok(Stmt {
                            kind: StmtKind::If {
                                then_body,
                                else_body,
                            },
                            span,
                        })
                    }
                    "while" | "for" => {
                        self.pos += 1;
                        self.skip_balanced_parens()?;
                        let body = self.parse_stmt_as_body()?;
                        Ok(Stmt {
                            kind: StmtKind::While { body },
                            span,
                        })
                    }
                    "return" => {
                        self.pos += 1;
                        self.skip_to_semi()?;
                        Ok(Stmt {
                            kind: StmtKind::Return,
                            span,
                        })
                    }
                    "asm" | "__asm__" | "__asm" => {
                        self.pos += 1;
                        self.parse_asm(span)
                    }
                    _ if is_type_word(&name) => {
                        // local declaration; initializers are not modeled
                        self.skip_to_semi()?;
                        Ok(Stmt {
                            kind: StmtKind::Nop,
                            span,
                        })
                    }
                    _ => {
                        self.pos += 1;
                        if self.peek_is_punct('(') {
                            let args = self.parse_call_args()?;
                            self.expect_punct(';')?;
                            self.classify_call(&name, &args, span)
                        } else if self.peek_is_punct('=') {
                            // `x = f(...);` keeps the call visible; any other
                            // assignment is not modeled
                            self.pos += 1;
                            if let (Some(TokenKind::Ident(callee)), Some(TokenKind::Punct('('))) =
                                (self.peek(), self.peek_nth(1))
                            {
                                let callee = callee.clone();
                                self.pos += 1;
                                let args = self.parse_call_args()?;
                                self.expect_punct(';')?;
                                self.classify_call(&callee, &args, span)
                            } else {
                                self.skip_to_semi()?;
                                Ok(Stmt {
                                    kind: StmtKind::Nop,
                                    span,
                                })
                            }
                        } else {
                            self.skip_to_semi()?;
                            Ok(Stmt {
                                kind: StmtKind::Nop,
                                span,
                            })
                        }
                    }
                }
            }
            Some(_) => self.err("expected a statement"),
            None => self.err("unexpected end of input"),
        }
    }

    fn classify_call(
        &self,
        callee: &str,
        args: &[Vec<Token>],
        span: Span,
    ) -> Result<Stmt, ParseError> {
        let kind = match KNOWN_API.get(callee) {
            Some(KnownApi::MutexLock) => StmtKind::Lock(self.lock_arg(args, span)?),
            Some(KnownApi::MutexUnlock) => StmtKind::Unlock(self.lock_arg(args, span)?),
            Some(KnownApi::MutexInit) => StmtKind::Nop,
            Some(KnownApi::ThreadCreate) => {
                let entry = args
                    .get(2)
                    .and_then(|arg| first_ident(arg))
                    .ok_or_else(|| ParseError {
                        span,
                        message: "pthread_create without a thread entry function".into(),
                    })?;
                StmtKind::ThreadCreate { entry }
            }
            Some(KnownApi::ThreadJoin) => StmtKind::Nop,
            Some(KnownApi::ThreadExit) | Some(KnownApi::Exit) => StmtKind::Return,
            None => StmtKind::Call {
                callee: callee.to_string(),
            },
        };
        Ok(Stmt { kind, span })
    }

    fn lock_arg(&self, args: &[Vec<Token>], span: Span) -> Result<String, ParseError> {
        args.get(0)
            .and_then(|arg| first_ident(arg))
            .ok_or_else(|| ParseError {
                span,
                message: "expected a mutex argument".into(),
            })
    }

    /// GCC-style `asm [volatile] ("template" : outputs : inputs : clobbers);`.
    /// Collects the identifiers of the output operands and the clobber
    /// strings; inputs cannot invalidate a lock and are skipped.
    fn parse_asm(&mut self, span: Span) -> Result<Stmt, ParseError> {
        while self.eat_ident("volatile") || self.eat_ident("__volatile__") || self.eat_ident("goto")
        {}
        self.expect_punct('(')?;
        let mut section = 0usize;
        let mut depth = 0usize;
        let mut operands: Vec<String> = Vec::new();
        loop {
            let tok = match self.bump() {
                Some(tok) => tok,
                None => {
                    return Err(ParseError {
                        span,
                        message: "unterminated asm statement".into(),
                    })
                }
            };
            match tok.kind {
                TokenKind::Punct('(') => depth += 1,
                TokenKind::Punct(')') => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Punct(':') if depth == 0 => section += 1,
                TokenKind::Ident(name) if section == 1 => {
                    if !operands.contains(&name) {
                        operands.push(name);
                    }
                }
                TokenKind::Str(s) if section == 3 => {
                    if !operands.contains(&s) {
                        operands.push(s);
                    }
                }
                _ => {}
            }
        }
        self.expect_punct(';')?;
        Ok(Stmt {
            kind: StmtKind::Asm { operands },
            span,
        })
    }

    /// Split a call's argument tokens at top-level commas.
    fn parse_call_args(&mut self) -> Result<Vec<Vec<Token>>, ParseError> {
        self.expect_punct('(')?;
        let mut args = Vec::new();
        let mut current: Vec<Token> = Vec::new();
        let mut depth = 0usize;
        loop {
            let tok = match self.bump() {
                Some(tok) => tok,
                None => return self.err("unterminated argument list"),
            };
            match tok.kind {
                TokenKind::Punct('(') => {
                    depth += 1;
                    current.push(tok);
                }
                TokenKind::Punct(')') => {
                    if depth == 0 {
                        if !current.is_empty() {
                            args.push(current);
                        }
                        return Ok(args);
                    }
                    depth -= 1;
                    current.push(tok);
                }
                TokenKind::Punct(',') if depth == 0 => {
                    args.push(std::mem::replace(&mut current, Vec::new()));
                }
                _ => current.push(tok),
            }
        }
    }

    fn skip_balanced_parens(&mut self) -> Result<(), ParseError> {
        self.expect_punct('(')?;
        let mut depth = 0usize;
        loop {
            match self.bump().map(|t| t.kind) {
                Some(TokenKind::Punct('(')) => depth += 1,
                Some(TokenKind::Punct(')')) => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                Some(_) => {}
                None => return self.err("expected `)`"),
            }
        }
    }

    fn skip_brackets(&mut self) -> Result<(), ParseError> {
        self.expect_punct('[')?;
        let mut depth = 0usize;
        loop {
            match self.bump().map(|t| t.kind) {
                Some(TokenKind::Punct('[')) => depth += 1,
                Some(TokenKind::Punct(']')) => {
                    if depth == 0 {
                        return Ok(());
                    }
                    depth -= 1;
                }
                Some(_) => {}
                None => return self.err("expected `]`"),
            }
        }
    }

    /// Consume up to and including the next `;` at nesting depth 0.
    fn skip_to_semi(&mut self) -> Result<(), ParseError> {
        let mut depth = 0usize;
        loop {
            match self.bump().map(|t| t.kind) {
                Some(TokenKind::Punct(c)) if c == '(' || c == '{' || c == '[' => depth += 1,
                Some(TokenKind::Punct(c)) if c == ')' || c == '}' || c == ']' => {
                    depth = depth.saturating_sub(1);
                }
                Some(TokenKind::Punct(';')) if depth == 0 => return Ok(()),
                Some(_) => {}
                None => return self.err("expected `;`"),
            }
        }
    }

    /// Consume an initializer expression, stopping before the `,` or `;`
    /// that ends the declarator.
    fn skip_initializer(&mut self) -> Result<(), ParseError> {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                Some(TokenKind::Punct(c)) if *c == '(' || *c == '{' || *c == '[' => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(TokenKind::Punct(c)) if *c == ')' || *c == '}' || *c == ']' => {
                    depth = depth.saturating_sub(1);
                    self.pos += 1;
                }
                Some(TokenKind::Punct(c)) if depth == 0 && (*c == ',' || *c == ';') => {
                    return Ok(());
                }
                Some(_) => self.pos += 1,
                None => return self.err("unterminated declaration"),
            }
        }
    }
}

fn first_ident(tokens: &[Token]) -> Option<String> {
    tokens.iter().find_map(|t| match &t.kind {
        TokenKind::Ident(s) if s != "NULL" => Some(s.clone()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASM_FIXTURE: &str = r#"//PARAM: --set ana.activated[+] deadlock --disable asm_is_nop
#include <pthread.h>

pthread_mutex_t lock_a;
pthread_mutex_t lock_b;

void *proc_a(void *arg) {
    pthread_mutex_lock(&lock_a);
    asm ("nop" : "=g" (lock_a));
    sleep(1);
    pthread_mutex_lock(&lock_b);
    pthread_exit(NULL);
}

void *proc_b(void *arg) {
    pthread_mutex_lock(&lock_b);
    sleep(1);
    pthread_mutex_lock(&lock_a);
    return NULL;
}

int main(void) {
    int x;
    pthread_t a, b;
    pthread_create(&a, NULL, proc_a, NULL);
    proc_b(NULL);
    puts("no deadlock!");
}
"#;

    #[test]
    fn test_known_api_table() {
        assert_eq!(KNOWN_API["pthread_mutex_lock"], KnownApi::MutexLock);
        assert_eq!(KNOWN_API["pthread_mutex_unlock"], KnownApi::MutexUnlock);
        assert_eq!(KNOWN_API["pthread_create"], KnownApi::ThreadCreate);
        assert_eq!(KNOWN_API["pthread_exit"], KnownApi::ThreadExit);
        assert!(KNOWN_API.get("sleep").is_none());
    }

    #[test]
    fn test_parse_asm_fixture() {
        let ast = parse(ASM_FIXTURE).unwrap();
        let lock_names: Vec<&str> = ast.locks.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(lock_names, ["lock_a", "lock_b"]);
        let fn_names: Vec<&str> = ast.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(fn_names, ["proc_a", "proc_b", "main"]);

        let proc_a = &ast.functions[0].body;
        assert!(matches!(&proc_a[0].kind, StmtKind::Lock(l) if l == "lock_a"));
        assert!(
            matches!(&proc_a[1].kind, StmtKind::Asm { operands } if operands == &["lock_a"])
        );
        assert!(matches!(&proc_a[2].kind, StmtKind::Call { callee } if callee == "sleep"));
        assert!(matches!(&proc_a[3].kind, StmtKind::Lock(l) if l == "lock_b"));
        assert!(matches!(&proc_a[4].kind, StmtKind::Return));

        let main = &ast.functions[2].body;
        assert!(matches!(
            &main[2].kind,
            StmtKind::ThreadCreate { entry } if entry == "proc_a"
        ));
        assert!(matches!(&main[3].kind, StmtKind::Call { callee } if callee == "proc_b"));
    }

    #[test]
    fn test_asm_operand_sections() {
        let src = r#"
void f(void) {
    __asm__ volatile ("mov %1, %0" : "=r" (out) : "r" (in_only) : "memory", "cc");
}
"#;
        let ast = parse(src).unwrap();
        match &ast.functions[0].body[0].kind {
            StmtKind::Asm { operands } => {
                assert_eq!(operands, &["out", "memory", "cc"]);
            }
            other => panic!("expected asm statement, got {:?}", other),
        }
    }

    #[test]
    fn test_branch_and_loop() {
        let src = r#"
pthread_mutex_t m;
int main(void) {
    int x;
    if (x) {
        pthread_mutex_lock(&m);
    } else {
        x = 1;
    }
    while (x) {
        pthread_mutex_unlock(&m);
    }
    return 0;
}
"#;
        let ast = parse(src).unwrap();
        let body = &ast.functions[0].body;
        match &body[1].kind {
            StmtKind::If {
                then_body,
                else_body,
            } => {
                assert!(matches!(&then_body[0].kind, StmtKind::Lock(l) if l == "m"));
                assert!(matches!(&else_body[0].kind, StmtKind::Nop));
            }
            other => panic!("expected if, got {:?}", other),
        }
        match &body[2].kind {
            StmtKind::While { body } => {
                assert!(matches!(&body[0].kind, StmtKind::Unlock(l) if l == "m"));
            }
            other => panic!("expected while, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = parse("int main(void) { @; }").unwrap_err();
        assert_eq!(err.span, Span { line: 1, col: 18 });
        assert!(err.to_string().contains("1:18"));
    }

    #[test]
    fn test_assignment_keeps_call_visible() {
        let src = r#"
pthread_mutex_t m;
int rc;
int main(void) {
    rc = pthread_mutex_lock(&m);
    rc = rc + 1;
    return rc;
}
"#;
        let ast = parse(src).unwrap();
        let body = &ast.functions[0].body;
        assert!(matches!(&body[0].kind, StmtKind::Lock(l) if l == "m"));
        assert!(matches!(&body[1].kind, StmtKind::Nop));
    }
}
