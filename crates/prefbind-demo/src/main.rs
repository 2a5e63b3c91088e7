#![forbid(unsafe_code)]

//! prefbind demo binary entry point.

use std::fs;
use std::process;

use prefbind_core::{PrefbindConfig, logging};
use prefbind_demo::cli;
use prefbind_demo::scenario;

fn main() {
    let opts = cli::Opts::parse();

    let base = match opts.config.as_deref() {
        Some(path) => PrefbindConfig::load(path),
        None => Ok(PrefbindConfig::default()),
    };
    let mut config = match base.and_then(PrefbindConfig::apply_env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e}");
            process::exit(1);
        }
    };
    if let Some(filter) = opts.log_filter {
        config.logging.filter = filter;
    }
    if opts.json_logs {
        config.logging.json = true;
    }
    logging::init(&config.logging);

    let report = match scenario::run(&config.dispatch, opts.rounds) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Demo failed: {e}");
            process::exit(1);
        }
    };

    let json = match serde_json::to_string_pretty(&report) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("Report error: {e}");
            process::exit(1);
        }
    };
    match opts.report {
        Some(path) => {
            if let Err(e) = fs::write(&path, json) {
                eprintln!("Failed to write {path}: {e}");
                process::exit(1);
            }
        }
        None => println!("{json}"),
    }
}
