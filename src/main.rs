use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use c_static_detector::config::{self, Config};

/// Static lockset-based concurrency-bug detector for pthread C programs.
#[derive(Parser)]
#[command(name = "c-static-detector", version)]
struct Opts {
    /// C source file to analyze.
    input: PathBuf,

    /// Set a string option, e.g. `--set ana.activated[+] deadlock`.
    #[arg(long = "set", num_args = 2, value_names = ["KEY", "VALUE"])]
    set: Vec<String>,

    /// Turn a boolean option on, e.g. `--enable dbg.dot`.
    #[arg(long, value_name = "KEY")]
    enable: Vec<String>,

    /// Turn a boolean option off, e.g. `--disable asm_is_nop`.
    #[arg(long, value_name = "KEY")]
    disable: Vec<String>,

    /// Regression-harness mode: apply the input's leading `//PARAM:`
    /// directive on top of the command line and exit with status 2 when any
    /// diagnostic is emitted.
    #[arg(long)]
    harness: bool,

    /// Log verbosity (-v: info, -vv: debug, -vvv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let level = match opts.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let _ = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );

    let source = fs::read_to_string(&opts.input)
        .with_context(|| format!("cannot read {}", opts.input.display()))?;

    let mut config = Config::default();
    for pair in opts.set.chunks(2) {
        config.set(&pair[0], &pair[1])?;
    }
    for key in &opts.enable {
        config.set_bool(key, true)?;
    }
    for key in &opts.disable {
        config.set_bool(key, false)?;
    }
    if opts.harness {
        if let Some(args) = config::param_directive(&source) {
            config.apply_args(args.iter().map(String::as_str))?;
        }
    }

    let file = opts.input.display().to_string();
    let report = c_static_detector::run(&source, &file, &config)?;
    for diagnostic in &report {
        println!("{}", diagnostic);
    }
    info!("{} diagnostic(s) emitted", report.len());
    if opts.harness && !report.is_empty() {
        process::exit(2);
    }
    Ok(())
}
