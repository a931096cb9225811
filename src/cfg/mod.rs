//! # cfg
//!
//! Lowers the parsed AST into per-function control-flow graphs.
//! A [`Body`] is a vector of basic blocks; block 0 is the entry. Statements
//! carry source spans; every block ends in an explicit terminator (`Goto`,
//! `Branch`, `Return`). Branch conditions are not modeled: both successors
//! are always considered reachable.
//!
//! Locks and functions are interned into program-wide id tables here; the
//! [`Program`] is the context object every later phase works against.

use std::collections::HashMap;

use log::debug;

use crate::parse::{Ast, Span, Stmt, StmtKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

/// A program point inside one function body: `statement_index` counts
/// statements, with one extra slot past the end for the terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub block: BlockId,
    pub statement_index: usize,
}

impl Location {
    pub const START: Location = Location {
        block: BlockId(0),
        statement_index: 0,
    };
}

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub name: String,
    pub span: Span,
}

#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub span: Span,
    pub body: Body,
}

#[derive(Debug)]
pub struct Body {
    pub blocks: Vec<BasicBlock>,
}

#[derive(Debug)]
pub struct BasicBlock {
    pub statements: Vec<Statement>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Lock(LockId),
    Unlock(LockId),
    /// Opaque instruction with the names from its output/clobber operand
    /// list. Its lockset effect is decided by the configured policy alone.
    Asm(AsmOperands),
    /// Call to a function defined in the analyzed program.
    Call(FuncId),
    /// `pthread_create` of a program-defined thread entry.
    ThreadCreate(FuncId),
    Nop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsmOperands {
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    pub kind: TerminatorKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminatorKind {
    Goto(BlockId),
    Branch(BlockId, BlockId),
    Return,
}

#[derive(Debug)]
pub struct Program {
    pub file: String,
    locks: Vec<LockInfo>,
    functions: Vec<Function>,
    lock_names: HashMap<String, LockId>,
    func_names: HashMap<String, FuncId>,
}

impl Program {
    pub fn from_ast(file: impl Into<String>, ast: &Ast) -> Self {
        let mut program = Program {
            file: file.into(),
            locks: Vec::new(),
            functions: Vec::new(),
            lock_names: HashMap::new(),
            func_names: HashMap::new(),
        };
        for decl in &ast.locks {
            program.intern_lock(&decl.name, decl.span);
        }
        // pre-intern names so calls resolve regardless of definition order
        for (i, f) in ast.functions.iter().enumerate() {
            program.func_names.insert(f.name.clone(), FuncId(i as u32));
        }
        for f in &ast.functions {
            let body = lower_body(&mut program, &f.body);
            program.functions.push(Function {
                name: f.name.clone(),
                span: f.span,
                body,
            });
        }
        program
    }

    fn intern_lock(&mut self, name: &str, span: Span) -> LockId {
        if let Some(&id) = self.lock_names.get(name) {
            return id;
        }
        let id = LockId(self.locks.len() as u32);
        self.locks.push(LockInfo {
            name: name.to_string(),
            span,
        });
        self.lock_names.insert(name.to_string(), id);
        id
    }

    pub fn locks(&self) -> &[LockInfo] {
        &self.locks
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn lock(&self, id: LockId) -> &LockInfo {
        &self.locks[id.0 as usize]
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn lock_by_name(&self, name: &str) -> Option<LockId> {
        self.lock_names.get(name).copied()
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    pub fn main_func(&self) -> Option<FuncId> {
        self.func_by_name("main")
    }
}

/// A statement or terminator position in a body, with CFG navigation.
#[derive(Debug, Clone, Copy)]
pub struct ProgramPoint<'a> {
    pub body: &'a Body,
    pub location: Location,
}

impl<'a> ProgramPoint<'a> {
    pub fn new(body: &'a Body, location: Location) -> Option<Self> {
        if Self::is_valid(body, location) {
            Some(ProgramPoint { body, location })
        } else {
            None
        }
    }

    pub fn is_valid(body: &Body, location: Location) -> bool {
        let block = match body.blocks.get(location.block.0) {
            Some(block) => block,
            None => return false,
        };
        location.statement_index <= block.statements.len()
    }

    fn block(&self) -> &'a BasicBlock {
        &self.body.blocks[self.location.block.0]
    }

    #[inline]
    pub fn is_terminator(&self) -> bool {
        self.location.statement_index == self.block().statements.len()
    }

    pub fn statement(&self) -> Option<&'a Statement> {
        self.block().statements.get(self.location.statement_index)
    }

    /// Meaningful only when `is_terminator()`.
    pub fn terminator(&self) -> &'a Terminator {
        &self.block().terminator
    }

    pub fn successors(&self) -> Vec<Location> {
        if self.is_terminator() {
            match self.terminator().kind {
                TerminatorKind::Goto(block) => vec![Location {
                    block,
                    statement_index: 0,
                }],
                TerminatorKind::Branch(then_block, else_block) => vec![
                    Location {
                        block: then_block,
                        statement_index: 0,
                    },
                    Location {
                        block: else_block,
                        statement_index: 0,
                    },
                ],
                TerminatorKind::Return => Vec::new(),
            }
        } else {
            vec![Location {
                block: self.location.block,
                statement_index: self.location.statement_index + 1,
            }]
        }
    }
}

struct BodyBuilder {
    blocks: Vec<(Vec<Statement>, Option<Terminator>)>,
    current: usize,
}

impl BodyBuilder {
    fn new() -> Self {
        Self {
            blocks: vec![(Vec::new(), None)],
            current: 0,
        }
    }

    fn new_block(&mut self) -> BlockId {
        self.blocks.push((Vec::new(), None));
        BlockId(self.blocks.len() - 1)
    }

    fn push(&mut self, stmt: Statement) {
        self.blocks[self.current].0.push(stmt);
    }

    /// Seal the current block; a no-op if it already has a terminator
    /// (e.g. a `return` inside a branch arm).
    fn terminate(&mut self, kind: TerminatorKind, span: Span) {
        if self.blocks[self.current].1.is_none() {
            self.blocks[self.current].1 = Some(Terminator { kind, span });
        }
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block.0;
    }

    fn finish(self, end_span: Span) -> Body {
        let blocks = self
            .blocks
            .into_iter()
            .map(|(statements, terminator)| BasicBlock {
                statements,
                terminator: terminator.unwrap_or(Terminator {
                    kind: TerminatorKind::Return,
                    span: end_span,
                }),
            })
            .collect();
        Body { blocks }
    }
}

fn lower_body(program: &mut Program, stmts: &[Stmt]) -> Body {
    let mut builder = BodyBuilder::new();
    lower_stmts(program, &mut builder, stmts);
    let end_span = stmts.last().map(|s| s.span).unwrap_or_default();
    builder.finish(end_span)
}

fn lower_stmts(program: &mut Program, builder: &mut BodyBuilder, stmts: &[Stmt]) {
    for stmt in stmts {
        lower_stmt(program, builder, stmt);
    }
}

fn lower_stmt(program: &mut Program, builder: &mut BodyBuilder, stmt: &Stmt) {
    let span = stmt.span;
    match &stmt.kind {
        StmtKind::Lock(name) => {
            let id = program.lock_by_name(name).unwrap_or_else(|| {
                debug!("lock `{}` used without a global declaration", name);
                program.intern_lock(name, span)
            });
            builder.push(Statement {
                kind: StatementKind::Lock(id),
                span,
            });
        }
        StmtKind::Unlock(name) => {
            let id = program.lock_by_name(name).unwrap_or_else(|| {
                debug!("lock `{}` used without a global declaration", name);
                program.intern_lock(name, span)
            });
            builder.push(Statement {
                kind: StatementKind::Unlock(id),
                span,
            });
        }
        StmtKind::Asm { operands } => {
            builder.push(Statement {
                kind: StatementKind::Asm(AsmOperands {
                    names: operands.clone(),
                }),
                span,
            });
        }
        StmtKind::ThreadCreate { entry } => match program.func_by_name(entry) {
            Some(func) => builder.push(Statement {
                kind: StatementKind::ThreadCreate(func),
                span,
            }),
            None => {
                debug!("pthread_create with unmodeled entry `{}`", entry);
                builder.push(Statement {
                    kind: StatementKind::Nop,
                    span,
                });
            }
        },
        StmtKind::Call { callee } => match program.func_by_name(callee) {
            Some(func) => builder.push(Statement {
                kind: StatementKind::Call(func),
                span,
            }),
            None => {
                debug!("call to unmodeled function `{}`", callee);
                builder.push(Statement {
                    kind: StatementKind::Nop,
                    span,
                });
            }
        },
        StmtKind::Return => {
            builder.terminate(TerminatorKind::Return, span);
            // anything following in the source block is unreachable
            let rest = builder.new_block();
            builder.switch_to(rest);
        }
        StmtKind::If {
            then_body,
            else_body,
        } => {
            let then_block = builder.new_block();
            let else_block = if else_body.is_empty() {
                None
            } else {
                Some(builder.new_block())
            };
            let join_block = builder.new_block();
            builder.terminate(
                TerminatorKind::Branch(then_block, else_block.unwrap_or(join_block)),
                span,
            );
            builder.switch_to(then_block);
            lower_stmts(program, builder, then_body);
            builder.terminate(TerminatorKind::Goto(join_block), span);
            if let Some(else_block) = else_block {
                builder.switch_to(else_block);
                lower_stmts(program, builder, else_body);
                builder.terminate(TerminatorKind::Goto(join_block), span);
            }
            builder.switch_to(join_block);
        }
        StmtKind::While { body } => {
            let head = builder.new_block();
            builder.terminate(TerminatorKind::Goto(head), span);
            let body_block = builder.new_block();
            let exit_block = builder.new_block();
            builder.switch_to(head);
            builder.terminate(TerminatorKind::Branch(body_block, exit_block), span);
            builder.switch_to(body_block);
            lower_stmts(program, builder, body);
            builder.terminate(TerminatorKind::Goto(head), span);
            builder.switch_to(exit_block);
        }
        StmtKind::Block(body) => lower_stmts(program, builder, body),
        StmtKind::Nop => {
            builder.push(Statement {
                kind: StatementKind::Nop,
                span,
            });
        }
    }
}
