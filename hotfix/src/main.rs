//! # hotfix - Inspection CLI
//!
//! Supports two modes:
//! - **Dry run** (`--func/--type/--namespace`): select targets in a binary
//!   and check that each one can host a redirect
//! - **Image listing** (`--pid <PID>`): show the executable images mapped into
//!   a running process, the candidates a patch module must not collide with

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use hotfix::cli::{format_inspection, inspect, process_images, Args};
use hotfix::preflight::{check_proc_access, run_preflight_checks};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_UNFIT: i32 = 3;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.to_string().to_lowercase().contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();

    if let Some(pid) = args.pid {
        check_proc_access(pid)?;
        let images =
            process_images(pid).with_context(|| format!("Failed to list images of {pid}"))?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&images)?);
        } else {
            for image in &images {
                println!("{:>18}  {}", image.base.to_string(), image.path.display());
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let Some(selector) = args.selector() else {
        bail!(
            "Missing required argument: --func, --type or --namespace\n\n\
             Usage:\n  \
             hotfix --binary ./server --func 'app::router::serve'\n  \
             hotfix --pid 1234\n\n\
             Run 'hotfix --help' for more options"
        );
    };

    let binary = match args.binary {
        Some(ref binary) => binary.clone(),
        None => std::env::current_exe().context("Failed to locate this executable")?,
    };
    run_preflight_checks(&binary, args.quiet)?;

    info!("Inspecting {}", binary.display());
    let inspection = inspect(&binary, &selector)
        .with_context(|| format!("Selection failed on {}", binary.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&inspection)?);
    } else {
        print!("{}", format_inspection(&inspection));
    }

    if inspection.all_fit() {
        Ok(EXIT_SUCCESS)
    } else {
        if !args.quiet {
            eprintln!("warning: some targets cannot host a redirect");
        }
        Ok(EXIT_UNFIT)
    }
}
