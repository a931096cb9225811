//! # diagnostics
//!
//! Structured analysis findings. A [`Diagnostic`] carries resolved names and
//! source locations so it renders without the analysis context; the derived
//! ordering makes a sorted report deterministic for identical input and
//! configuration.

use std::fmt;

use crate::parse::Span;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub fn new(file: &str, span: Span) -> Self {
        Self {
            file: file.to_string(),
            line: span.line,
            col: span.col,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// One observed acquisition backing an edge of a reported cycle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AcquireWitness {
    pub context: String,
    pub held: String,
    pub acquired: String,
    pub location: SourceLoc,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Diagnostic {
    PotentialDeadlock {
        locks: Vec<String>,
        witnesses: Vec<AcquireWitness>,
    },
    UnmatchedUnlock {
        lock: String,
        context: String,
        location: SourceLoc,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::PotentialDeadlock { locks, witnesses } => {
                let names = locks
                    .iter()
                    .map(|l| format!("`{}`", l))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "potential deadlock: cyclic acquisition order between {}", names)?;
                for w in witnesses {
                    write!(
                        f,
                        "\n  {} acquires `{}` at {} while holding `{}`",
                        w.context, w.acquired, w.location, w.held
                    )?;
                }
                Ok(())
            }
            Diagnostic::UnmatchedUnlock {
                lock,
                context,
                location,
            } => write!(
                f,
                "unlock of `{}` at {} in {}, but it is not known to be held",
                lock, location, context
            ),
        }
    }
}
