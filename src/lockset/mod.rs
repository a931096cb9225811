//! # lockset
//!
//! Must/may lockset abstract interpretation, one fixpoint per thread context.
//!
//! For every reachable program point the analysis keeps the state *before*
//! the point executes: the set of locks held on all paths (must) and on at
//! least one path (may). Merges intersect the must set and union the may
//! set, so over iterations the must set only shrinks and the may set only
//! grows; with a finite lock universe the worklist therefore drains.
//!
//! Calls to program-defined functions propagate the caller state into the
//! callee entry and the callee's merged return state back to the call's
//! successor, within the same thread context. Opaque instructions are
//! interpreted through the configured [`AsmPolicy`] only.

use std::collections::{BTreeSet, HashMap, VecDeque};

use log::{debug, trace};

use crate::callgraph::ThreadContext;
use crate::cfg::{
    BlockId, FuncId, Location, LockId, Program, ProgramPoint, StatementKind, TerminatorKind,
};
use crate::config::AsmPolicy;
use crate::lockgraph::{Acquire, LockGraph};
use crate::parse::Span;

pub type LockSet = BTreeSet<LockId>;

/// The lockset abstraction at one program point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocksetPair {
    pub must: LockSet,
    pub may: LockSet,
}

impl LocksetPair {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge another reached state into this one: must-hold is the
    /// intersection, may-hold the union. Returns whether anything changed.
    pub fn join(&mut self, other: &LocksetPair) -> bool {
        let must_before = self.must.len();
        let may_before = self.may.len();
        let other_must = &other.must;
        self.must.retain(|lock| other_must.contains(lock));
        self.may.extend(other.may.iter().copied());
        self.must.len() != must_before || self.may.len() != may_before
    }
}

/// A program point qualified by its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Point {
    pub func: FuncId,
    pub location: Location,
}

pub struct LocksetAnalysis<'a> {
    program: &'a Program,
    policy: AsmPolicy,
    ctx: ThreadContext,
    /// State before each reached point; absent means unreachable so far.
    states: HashMap<Point, LocksetPair>,
    /// Merged state over the `return` points of each function.
    exit_states: HashMap<FuncId, LocksetPair>,
    /// Call points waiting on a callee's exit state.
    callers: HashMap<FuncId, BTreeSet<Point>>,
    worklist: VecDeque<Point>,
}

impl<'a> LocksetAnalysis<'a> {
    pub fn new(program: &'a Program, policy: AsmPolicy, ctx: ThreadContext) -> Self {
        Self {
            program,
            policy,
            ctx,
            states: HashMap::new(),
            exit_states: HashMap::new(),
            callers: HashMap::new(),
            worklist: VecDeque::new(),
        }
    }

    pub fn context(&self) -> ThreadContext {
        self.ctx
    }

    /// Run the worklist to a fixpoint. The spawned (or main) thread starts
    /// with nothing held.
    pub fn run(&mut self) {
        let entry = Point {
            func: self.ctx.root,
            location: Location::START,
        };
        self.states.insert(entry, LocksetPair::empty());
        self.worklist.push_back(entry);
        let mut steps = 0usize;
        while let Some(point) = self.worklist.pop_front() {
            steps += 1;
            self.step(point);
        }
        debug!(
            "lockset fixpoint for {} after {} worklist steps",
            self.ctx.describe(self.program),
            steps
        );
    }

    fn step(&mut self, point: Point) {
        let state = match self.states.get(&point) {
            Some(state) => state.clone(),
            None => return,
        };
        let body = &self.program.function(point.func).body;
        let pp = match ProgramPoint::new(body, point.location) {
            Some(pp) => pp,
            None => return,
        };

        if pp.is_terminator() {
            match pp.terminator().kind {
                TerminatorKind::Goto(_) | TerminatorKind::Branch(_, _) => {
                    for succ in pp.successors() {
                        self.flow(
                            Point {
                                func: point.func,
                                location: succ,
                            },
                            &state,
                        );
                    }
                }
                TerminatorKind::Return => {
                    let changed = match self.exit_states.get_mut(&point.func) {
                        Some(exit) => exit.join(&state),
                        None => {
                            self.exit_states.insert(point.func, state);
                            true
                        }
                    };
                    if changed {
                        // revisit every call site waiting on this function
                        let waiting: Vec<Point> = self
                            .callers
                            .get(&point.func)
                            .map(|points| points.iter().copied().collect())
                            .unwrap_or_default();
                        for call_point in waiting {
                            self.worklist.push_back(call_point);
                        }
                    }
                }
            }
            return;
        }

        let stmt = match pp.statement() {
            Some(stmt) => stmt,
            None => return,
        };
        let succ = Point {
            func: point.func,
            location: Location {
                block: point.location.block,
                statement_index: point.location.statement_index + 1,
            },
        };
        match &stmt.kind {
            StatementKind::Lock(lock) => {
                let mut out = state;
                out.must.insert(*lock);
                out.may.insert(*lock);
                trace!(
                    "{}: lock `{}`, must-lockset {:?}",
                    stmt.span,
                    self.program.lock(*lock).name,
                    out.must
                );
                self.flow(succ, &out);
            }
            StatementKind::Unlock(lock) => {
                let mut out = state;
                out.must.remove(lock);
                out.may.remove(lock);
                self.flow(succ, &out);
            }
            StatementKind::Asm(operands) => {
                let mut out = state;
                if let AsmPolicy::Opaque = self.policy {
                    // the instruction may have released or corrupted any lock
                    // it names; matching is by name
                    for name in &operands.names {
                        if let Some(lock) = self.program.lock_by_name(name) {
                            if out.must.remove(&lock) {
                                debug!(
                                    "opaque instruction at {} drops `{}` from the must-lockset",
                                    stmt.span, name
                                );
                            }
                        }
                    }
                }
                self.flow(succ, &out);
            }
            StatementKind::Call(callee) => {
                self.callers.entry(*callee).or_default().insert(point);
                self.flow(
                    Point {
                        func: *callee,
                        location: Location::START,
                    },
                    &state,
                );
                // the successor is only reached once the callee can return
                if let Some(exit) = self.exit_states.get(callee).cloned() {
                    self.flow(succ, &exit);
                }
            }
            StatementKind::ThreadCreate(_) | StatementKind::Nop => {
                self.flow(succ, &state);
            }
        }
    }

    fn flow(&mut self, to: Point, state: &LocksetPair) {
        match self.states.get_mut(&to) {
            Some(existing) => {
                if existing.join(state) {
                    self.worklist.push_back(to);
                }
            }
            None => {
                self.states.insert(to, state.clone());
                self.worklist.push_back(to);
            }
        }
    }

    /// Record `held -> acquired` edges from the stabilized pre-states at
    /// every lock acquisition reached in this thread context. Iteration is
    /// in program order, so the recorded witness spans are deterministic.
    pub fn record_acquisitions(&self, graph: &mut LockGraph) {
        self.walk_reached(|stmt_kind, span, state| {
            let acquired = match stmt_kind {
                StatementKind::Lock(lock) => *lock,
                _ => return,
            };
            for &held in &state.must {
                if held != acquired {
                    graph.add_acquire(
                        held,
                        acquired,
                        Acquire {
                            ctx: self.ctx.id,
                            span,
                        },
                    );
                }
            }
        });
    }

    /// Unlocks of locks not even in the may-lockset: a diagnosable condition,
    /// never a failure of the tracker itself.
    pub fn unmatched_unlocks(&self) -> Vec<(LockId, Span)> {
        let mut found = Vec::new();
        self.walk_reached(|stmt_kind, span, state| {
            if let StatementKind::Unlock(lock) = stmt_kind {
                if !state.may.contains(lock) {
                    found.push((*lock, span));
                }
            }
        });
        found.sort_unstable();
        found
    }

    /// Visit every reached statement with its stabilized pre-state, in
    /// program order.
    fn walk_reached<F>(&self, mut visit: F)
    where
        F: FnMut(&StatementKind, Span, &LocksetPair),
    {
        for (func_idx, function) in self.program.functions().iter().enumerate() {
            let func = FuncId(func_idx as u32);
            for (block_idx, block) in function.body.blocks.iter().enumerate() {
                for (stmt_idx, stmt) in block.statements.iter().enumerate() {
                    let point = Point {
                        func,
                        location: Location {
                            block: BlockId(block_idx),
                            statement_index: stmt_idx,
                        },
                    };
                    if let Some(state) = self.states.get(&point) {
                        visit(&stmt.kind, stmt.span, state);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn state_at(&self, func: FuncId, block: usize, statement_index: usize) -> Option<&LocksetPair> {
        self.states.get(&Point {
            func,
            location: Location {
                block: BlockId(block),
                statement_index,
            },
        })
    }

    #[cfg(test)]
    fn states_snapshot(&self) -> HashMap<Point, LocksetPair> {
        self.states.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callgraph::{ThreadContext, ThreadContextId};
    use crate::parse;

    fn analyze(src: &str, policy: AsmPolicy) -> (Program, LocksetAnalysis<'_>) {
        // leaked so the analysis can borrow the program in a return value;
        // test-only
        let program: &'static Program = Box::leak(Box::new(Program::from_ast(
            "test.c",
            &parse::parse(src).unwrap(),
        )));
        let ctx = ThreadContext {
            id: ThreadContextId(0),
            root: program.main_func().expect("test program needs main"),
            spawn: None,
        };
        let mut analysis = LocksetAnalysis::new(program, policy, ctx);
        analysis.run();
        (
            Program::from_ast("test.c", &parse::parse(src).unwrap()),
            analysis,
        )
    }

    #[test]
    fn test_join_must_shrinks_may_grows() {
        let mut a = LocksetPair::empty();
        a.must.insert(LockId(0));
        a.must.insert(LockId(1));
        a.may.insert(LockId(0));
        a.may.insert(LockId(1));
        let mut b = LocksetPair::empty();
        b.must.insert(LockId(1));
        b.may.insert(LockId(1));
        b.may.insert(LockId(2));

        let changed = a.join(&b);
        assert!(changed);
        assert_eq!(a.must.iter().copied().collect::<Vec<_>>(), [LockId(1)]);
        assert_eq!(
            a.may.iter().copied().collect::<Vec<_>>(),
            [LockId(0), LockId(1), LockId(2)]
        );
        // joining again changes nothing
        assert!(!a.join(&b));
    }

    #[test]
    fn test_straight_line_lock_unlock() {
        let (_, analysis) = analyze(
            r#"
pthread_mutex_t m;
int main(void) {
    pthread_mutex_lock(&m);
    pthread_mutex_unlock(&m);
    return 0;
}
"#,
            AsmPolicy::Nop,
        );
        let main = FuncId(0);
        // before the lock: nothing held
        let before = analysis.state_at(main, 0, 0).unwrap();
        assert!(before.must.is_empty() && before.may.is_empty());
        // between lock and unlock: m held on all paths
        let held = analysis.state_at(main, 0, 1).unwrap();
        assert!(held.must.contains(&LockId(0)));
        // after the unlock
        let after = analysis.state_at(main, 0, 2).unwrap();
        assert!(after.must.is_empty() && after.may.is_empty());
    }

    #[test]
    fn test_branch_merge_intersects_must() {
        let (_, analysis) = analyze(
            r#"
pthread_mutex_t m;
int main(void) {
    int x;
    if (x) {
        pthread_mutex_lock(&m);
    }
    sleep(1);
    return 0;
}
"#,
            AsmPolicy::Nop,
        );
        // the join block (2) starts at the sleep statement: m held on only
        // one incoming path
        let merged = analysis.state_at(FuncId(0), 2, 0).unwrap();
        assert!(merged.must.is_empty());
        assert!(merged.may.contains(&LockId(0)));
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let (_, analysis) = analyze(
            r#"
pthread_mutex_t m;
int main(void) {
    int x;
    while (x) {
        pthread_mutex_lock(&m);
        pthread_mutex_unlock(&m);
    }
    return 0;
}
"#,
            AsmPolicy::Nop,
        );
        let main = FuncId(0);
        // the loop head (block 1) merges the pre-loop and post-iteration
        // states; each iteration releases m, so nothing is held there
        let head_state = analysis.state_at(main, 1, 0).unwrap();
        assert!(head_state.must.is_empty());
        assert!(head_state.may.is_empty());
        // the loop exit (block 3) is reached
        assert!(analysis.state_at(main, 3, 0).is_some());
    }

    #[test]
    fn test_fixpoint_is_idempotent() {
        let src = r#"
pthread_mutex_t a;
pthread_mutex_t b;
void helper(void) {
    pthread_mutex_lock(&b);
    pthread_mutex_unlock(&b);
}
int main(void) {
    int x;
    pthread_mutex_lock(&a);
    while (x) {
        helper();
    }
    pthread_mutex_unlock(&a);
    return 0;
}
"#;
        let (_, first) = analyze(src, AsmPolicy::Nop);
        let (_, second) = analyze(src, AsmPolicy::Nop);
        assert_eq!(first.states_snapshot(), second.states_snapshot());
    }

    #[test]
    fn test_call_propagates_held_locks() {
        let (program, analysis) = analyze(
            r#"
pthread_mutex_t a;
pthread_mutex_t b;
void helper(void) {
    pthread_mutex_lock(&b);
    pthread_mutex_unlock(&b);
}
int main(void) {
    pthread_mutex_lock(&a);
    helper();
    pthread_mutex_unlock(&a);
    return 0;
}
"#,
            AsmPolicy::Nop,
        );
        let helper = program.func_by_name("helper").unwrap();
        let a = program.lock_by_name("a").unwrap();
        // a is held at helper's entry
        let entry = analysis.state_at(helper, 0, 0).unwrap();
        assert!(entry.must.contains(&a));
        // and the acquisition edge a -> b is recorded
        let mut graph = LockGraph::new();
        analysis.record_acquisitions(&mut graph);
        let b = program.lock_by_name("b").unwrap();
        assert_eq!(graph.acquires(a, b).len(), 1);
    }

    #[test]
    fn test_opaque_policy_drops_named_lock_only() {
        let src = r#"
pthread_mutex_t a;
pthread_mutex_t b;
int main(void) {
    pthread_mutex_lock(&a);
    pthread_mutex_lock(&b);
    asm ("nop" : "=g" (a));
    sleep(1);
    return 0;
}
"#;
        let (program, nop) = analyze(src, AsmPolicy::Nop);
        let (_, opaque) = analyze(src, AsmPolicy::Opaque);
        let a = program.lock_by_name("a").unwrap();
        let b = program.lock_by_name("b").unwrap();

        // state before the sleep, i.e. after the asm
        let after_asm_nop = nop.state_at(FuncId(0), 0, 3).unwrap();
        assert!(after_asm_nop.must.contains(&a));
        assert!(after_asm_nop.must.contains(&b));

        let after_asm_opaque = opaque.state_at(FuncId(0), 0, 3).unwrap();
        assert!(!after_asm_opaque.must.contains(&a));
        // the unnamed lock is untouched, and may-hold keeps both
        assert!(after_asm_opaque.must.contains(&b));
        assert!(after_asm_opaque.may.contains(&a));
        assert!(after_asm_opaque.may.contains(&b));
    }

    #[test]
    fn test_unmatched_unlock_is_flagged_not_fatal() {
        let (program, analysis) = analyze(
            r#"
pthread_mutex_t a;
int main(void) {
    pthread_mutex_unlock(&a);
    return 0;
}
"#,
            AsmPolicy::Nop,
        );
        let a = program.lock_by_name("a").unwrap();
        let unlocks = analysis.unmatched_unlocks();
        assert_eq!(unlocks.len(), 1);
        assert_eq!(unlocks[0].0, a);
    }
}
