//! # c-static-detector
//!
//! Static lockset-based concurrency-bug detection for pthread C programs.
//!
//! Pipeline: source text -> AST ([`parse`]) -> control-flow graphs and the
//! lock/function tables ([`cfg`]) -> callgraph and thread contexts
//! ([`callgraph`]) -> per-context must/may lockset fixpoint ([`lockset`]) ->
//! merged acquisition-order graph ([`lockgraph`]) -> cycle scan and report
//! ([`detector`], [`diagnostics`]).
//!
//! The analyzer never executes the analyzed program; every interleaving of
//! the declared threads is covered by the must/may lattice.

pub mod callgraph;
pub mod cfg;
pub mod config;
pub mod detector;
pub mod diagnostics;
pub mod lockgraph;
pub mod lockset;
pub mod parse;

use anyhow::{anyhow, bail, Result};

use config::Config;
use detector::deadlock::DeadlockDetector;
use diagnostics::Diagnostic;

/// Parse `source` and run every activated analysis over it. The report is
/// sorted, so identical input and configuration always render identically.
pub fn run(source: &str, file: &str, config: &Config) -> Result<Vec<Diagnostic>> {
    let ast = parse::parse(source).map_err(|err| anyhow!("{}: {}", file, err))?;
    let program = cfg::Program::from_ast(file, &ast);
    let mut report = Vec::new();
    for analysis in &config.activated {
        match analysis.as_str() {
            "deadlock" => report.extend(DeadlockDetector::new(&program, config).analyze()),
            other => bail!("unknown analysis `{}`", other),
        }
    }
    report.sort();
    Ok(report)
}
