//! # config
//!
//! Analysis configuration: the set of activated analyses plus the boolean
//! options, selected once per run. `asm_is_nop` chooses the opaque-instruction
//! policy the lockset tracker consults at every `asm` site.
//!
//! Regression fixtures carry their configuration in a leading `//PARAM:`
//! line using the same `--set`/`--enable`/`--disable` words as the command
//! line; [`param_directive`] extracts it for the harness.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// How the lockset tracker interprets an instruction it cannot model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmPolicy {
    /// The instruction has no effect on any lockset.
    Nop,
    /// The instruction may have released or corrupted every lock named in
    /// its output/clobber operands: those leave the must-lockset.
    Opaque,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Names of activated analyses, e.g. `deadlock`.
    pub activated: BTreeSet<String>,
    /// Treat inline assembly as a no-op (default) instead of as opaque.
    pub asm_is_nop: bool,
    /// Diagnose unlocks of locks not known to be held.
    pub warn_unmatched_unlock: bool,
    /// Dump the call and acquisition-order graphs in dot format.
    pub dump_dot: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            activated: BTreeSet::new(),
            asm_is_nop: true,
            warn_unmatched_unlock: true,
            dump_dot: false,
        }
    }
}

impl Config {
    pub fn asm_policy(&self) -> AsmPolicy {
        if self.asm_is_nop {
            AsmPolicy::Nop
        } else {
            AsmPolicy::Opaque
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "ana.activated[+]" => {
                self.activated.insert(value.to_string());
                Ok(())
            }
            _ => bail!("unknown option `{}`", key),
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<()> {
        match key {
            "asm_is_nop" => self.asm_is_nop = value,
            "warn_unmatched_unlock" => self.warn_unmatched_unlock = value,
            "dbg.dot" => self.dump_dot = value,
            _ => bail!("unknown boolean option `{}`", key),
        }
        Ok(())
    }

    /// Apply `--set KEY VALUE | --enable KEY | --disable KEY` argument
    /// words, the syntax `//PARAM:` directives use.
    pub fn apply_args<'a, I>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg {
                "--set" => match (args.next(), args.next()) {
                    (Some(key), Some(value)) => self.set(key, value)?,
                    _ => bail!("--set expects a key and a value"),
                },
                "--enable" => match args.next() {
                    Some(key) => self.set_bool(key, true)?,
                    None => bail!("--enable expects a key"),
                },
                "--disable" => match args.next() {
                    Some(key) => self.set_bool(key, false)?,
                    None => bail!("--disable expects a key"),
                },
                other => bail!("unknown directive argument `{}`", other),
            }
        }
        Ok(())
    }
}

static PARAM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^//\s*PARAM\s*:\s*(.+)$").unwrap());

/// The `//PARAM: ...` directive on the first line of a fixture, split into
/// argument words. This is read by the regression harness, not by normal
/// command-line use.
pub fn param_directive(source: &str) -> Option<Vec<String>> {
    let first = source.lines().next()?;
    let caps = PARAM_RE.captures(first.trim_end())?;
    Some(caps[1].split_whitespace().map(str::to_string).collect())
}
