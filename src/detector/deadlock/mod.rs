//! # deadlock
//!
//! Lockset-based deadlock detection.
//! 1. Build the callgraph and derive the thread contexts.
//! 2. Run the lockset fixpoint per context; contexts share no mutable state.
//! 3. Merge every context's acquisition edges into one acquisition-order
//!    graph.
//! 4. Report each elementary cycle whose edges come from at least two
//!    distinct thread contexts.

use std::collections::BTreeSet;

use log::{debug, info};

use crate::callgraph::CallGraph;
use crate::cfg::{FuncId, Program};
use crate::config::Config;
use crate::diagnostics::{AcquireWitness, Diagnostic, SourceLoc};
use crate::lockgraph::LockGraph;
use crate::lockset::LocksetAnalysis;

pub struct DeadlockDetector<'a> {
    pub program: &'a Program,
    pub config: &'a Config,
}

impl<'a> DeadlockDetector<'a> {
    pub fn new(program: &'a Program, config: &'a Config) -> Self {
        Self { program, config }
    }

    pub fn analyze(&self) -> Vec<Diagnostic> {
        info!("running deadlock analysis on {}", self.program.file);
        let mut callgraph = CallGraph::new();
        let funcs: Vec<FuncId> = (0..self.program.functions().len())
            .map(|i| FuncId(i as u32))
            .collect();
        callgraph.analyze(funcs, self.program);
        if self.config.dump_dot {
            callgraph.dot(self.program);
        }
        let contexts = callgraph.thread_contexts(self.program);
        debug!("{} thread context(s)", contexts.len());

        let mut lockgraph = LockGraph::new();
        let mut report = Vec::new();
        for &ctx in &contexts {
            let mut analysis =
                LocksetAnalysis::new(self.program, self.config.asm_policy(), ctx);
            analysis.run();
            analysis.record_acquisitions(&mut lockgraph);
            if self.config.warn_unmatched_unlock {
                for (lock, span) in analysis.unmatched_unlocks() {
                    report.push(Diagnostic::UnmatchedUnlock {
                        lock: self.program.lock(lock).name.clone(),
                        context: ctx.describe(self.program),
                        location: SourceLoc::new(&self.program.file, span),
                    });
                }
            }
        }
        if self.config.dump_dot {
            lockgraph.dot(self.program);
        }

        for cycle in lockgraph.cycles() {
            let mut cycle_contexts = BTreeSet::new();
            let mut witnesses = Vec::new();
            for (i, &held) in cycle.iter().enumerate() {
                let acquired = cycle[(i + 1) % cycle.len()];
                for acquire in lockgraph.acquires(held, acquired) {
                    cycle_contexts.insert(acquire.ctx);
                    // context ids index the context list
                    let ctx = contexts[acquire.ctx.0 as usize];
                    witnesses.push(AcquireWitness {
                        context: ctx.describe(self.program),
                        held: self.program.lock(held).name.clone(),
                        acquired: self.program.lock(acquired).name.clone(),
                        location: SourceLoc::new(&self.program.file, acquire.span),
                    });
                }
            }
            if cycle_contexts.len() < 2 {
                // a single thread cannot race itself into this cycle
                debug!(
                    "suppressing single-context cycle over {:?}",
                    cycle
                        .iter()
                        .map(|&l| self.program.lock(l).name.as_str())
                        .collect::<Vec<_>>()
                );
                continue;
            }
            let locks = cycle
                .iter()
                .map(|&l| self.program.lock(l).name.clone())
                .collect();
            report.push(Diagnostic::PotentialDeadlock { locks, witnesses });
        }
        report.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn detect(src: &str, configure: impl FnOnce(&mut Config)) -> Vec<Diagnostic> {
        let program = Program::from_ast("test.c", &parse::parse(src).unwrap());
        let mut config = Config::default();
        config.activated.insert("deadlock".to_string());
        configure(&mut config);
        DeadlockDetector::new(&program, &config).analyze()
    }

    const OPPOSITE_ORDER: &str = r#"
pthread_mutex_t a;
pthread_mutex_t b;
void *first(void *arg) {
    pthread_mutex_lock(&a);
    pthread_mutex_lock(&b);
    pthread_mutex_unlock(&b);
    pthread_mutex_unlock(&a);
    return NULL;
}
void *second(void *arg) {
    pthread_mutex_lock(&b);
    pthread_mutex_lock(&a);
    pthread_mutex_unlock(&a);
    pthread_mutex_unlock(&b);
    return NULL;
}
int main(void) {
    pthread_t t;
    pthread_create(&t, NULL, first, NULL);
    second(NULL);
    return 0;
}
"#;

    #[test]
    fn test_opposite_order_is_reported() {
        let report = detect(OPPOSITE_ORDER, |_| {});
        assert_eq!(report.len(), 1);
        match &report[0] {
            Diagnostic::PotentialDeadlock { locks, witnesses } => {
                assert_eq!(locks, &["a", "b"]);
                assert_eq!(witnesses.len(), 2);
            }
            other => panic!("expected a deadlock diagnostic, got {:?}", other),
        }
    }

    #[test]
    fn test_single_context_cycle_is_suppressed() {
        let report = detect(
            r#"
pthread_mutex_t a;
pthread_mutex_t b;
int main(void) {
    pthread_mutex_lock(&a);
    pthread_mutex_lock(&b);
    pthread_mutex_unlock(&b);
    pthread_mutex_unlock(&a);
    pthread_mutex_lock(&b);
    pthread_mutex_lock(&a);
    pthread_mutex_unlock(&a);
    pthread_mutex_unlock(&b);
    return 0;
}
"#,
            |_| {},
        );
        assert!(report.is_empty());
    }

    #[test]
    fn test_report_is_deterministic() {
        let first = detect(OPPOSITE_ORDER, |_| {});
        let second = detect(OPPOSITE_ORDER, |_| {});
        assert_eq!(first, second);
        let rendered_first: Vec<String> = first.iter().map(|d| d.to_string()).collect();
        let rendered_second: Vec<String> = second.iter().map(|d| d.to_string()).collect();
        assert_eq!(rendered_first, rendered_second);
    }
}
