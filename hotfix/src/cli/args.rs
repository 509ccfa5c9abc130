//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::selection::Selector;

#[derive(Parser)]
#[command(
    name = "hotfix",
    about = "Dry-run hotfix target selection against an ELF binary",
    after_help = "\
EXAMPLES:
    hotfix --binary ./server --func 'app::router::serve'     Check one function
    hotfix --binary ./server --type 'app::cache::Lru'         Every method of a type
    hotfix --binary ./server --namespace 'app::billing::'     Everything in a module
    hotfix --pid 1234                                         Images mapped into a process"
)]
pub struct Args {
    /// ELF binary to inspect (defaults to this executable)
    #[arg(short, long, value_name = "ELF")]
    pub binary: Option<PathBuf>,

    /// List the executable images mapped into a running process
    #[arg(short, long, conflicts_with_all = ["func", "types", "namespace"])]
    pub pid: Option<i32>,

    /// Fully qualified function name (repeatable)
    #[arg(short, long, value_name = "NAME")]
    pub func: Vec<String>,

    /// Struct or pointer-to-struct whose methods are selected (repeatable)
    #[arg(short = 't', long = "type", value_name = "NAME")]
    pub types: Vec<String>,

    /// Name prefix selecting every function below it (repeatable)
    #[arg(short, long, value_name = "PREFIX")]
    pub namespace: Vec<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Union of every selection flag; `None` if none was given
    #[must_use]
    pub fn selector(&self) -> Option<Selector> {
        let mut parts = Vec::new();
        if !self.func.is_empty() {
            parts.push(Selector::func(self.func.iter().cloned()));
        }
        if !self.types.is_empty() {
            parts.push(Selector::types(self.types.iter().cloned()));
        }
        if !self.namespace.is_empty() {
            parts.push(Selector::namespace(self.namespace.iter().cloned()));
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Selector::any(parts)),
        }
    }
}
