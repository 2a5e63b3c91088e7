#![forbid(unsafe_code)]

//! Command-line argument parsing for the demo.
//!
//! Args are parsed by hand. `PREFBIND_DEMO_*` variables supply defaults and
//! flags override them. Logging variables (`PREFBIND_LOG`, ...) are read by
//! [`prefbind_core::PrefbindConfig::apply_env`], not here.

use std::env;
use std::process;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const HELP_TEXT: &str = "\
prefbind demo: replays platform changes through shared observables

USAGE:
    prefbind-demo [OPTIONS]

OPTIONS:
    --config=PATH        JSON config file (logging, dispatch)
    --log=FILTER         Log filter, e.g. 'info,prefbind_core=debug'
    --json-logs          Emit logs as JSON lines
    --rounds=N           Number of change rounds to replay (default: 2)
    --report=PATH        Write the delivery report here instead of stdout
    --help, -h           Show this help message
    --version, -V        Show version

ENVIRONMENT VARIABLES:
    PREFBIND_DEMO_CONFIG     Same as --config
    PREFBIND_DEMO_ROUNDS     Same as --rounds
    PREFBIND_DEMO_REPORT     Same as --report
    PREFBIND_LOG             Log filter (overridden by --log)
    PREFBIND_LOG_JSON        Set to 1 for JSON logs";

/// Parsed command-line options.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Config file to load before env overrides.
    pub config: Option<String>,
    /// Log filter that wins over config and env.
    pub log_filter: Option<String>,
    /// Force JSON logs on.
    pub json_logs: bool,
    /// Change rounds to replay.
    pub rounds: u32,
    /// Report destination. `None` means stdout.
    pub report: Option<String>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            config: None,
            log_filter: None,
            json_logs: false,
            rounds: 2,
            report: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParseError {
    Help,
    Version,
    InvalidValue { flag: &'static str, value: String },
    UnknownArg(String),
}

impl Opts {
    /// Parse from the process environment and args. Exits on `--help`,
    /// `--version`, or bad input.
    pub fn parse() -> Self {
        match Self::parse_from_env_and_args(env::args().skip(1), |key| env::var(key).ok()) {
            Ok(opts) => opts,
            Err(ParseError::Help) => {
                println!("{HELP_TEXT}");
                process::exit(0);
            }
            Err(ParseError::Version) => {
                println!("prefbind-demo {VERSION}");
                process::exit(0);
            }
            Err(ParseError::InvalidValue { flag, value }) => {
                eprintln!("Invalid {flag} value: {value}");
                process::exit(1);
            }
            Err(ParseError::UnknownArg(arg)) => {
                eprintln!("Unknown argument: {arg}");
                eprintln!("Run with --help for usage information.");
                process::exit(1);
            }
        }
    }

    fn parse_from_env_and_args<I, S, F>(args: I, get_env: F) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = Self::default();

        if let Some(val) = get_env("PREFBIND_DEMO_CONFIG")
            && !val.is_empty()
        {
            opts.config = Some(val);
        }
        if let Some(val) = get_env("PREFBIND_DEMO_ROUNDS")
            && let Ok(n) = val.trim().parse()
        {
            opts.rounds = n;
        }
        if let Some(val) = get_env("PREFBIND_DEMO_REPORT")
            && !val.is_empty()
        {
            opts.report = Some(val);
        }

        for arg in args {
            match arg.as_ref() {
                "--help" | "-h" => return Err(ParseError::Help),
                "--version" | "-V" => return Err(ParseError::Version),
                "--json-logs" => opts.json_logs = true,
                other => {
                    if let Some(val) = other.strip_prefix("--config=") {
                        if val.is_empty() {
                            return Err(ParseError::InvalidValue {
                                flag: "--config",
                                value: val.to_string(),
                            });
                        }
                        opts.config = Some(val.to_string());
                    } else if let Some(val) = other.strip_prefix("--log=") {
                        opts.log_filter = Some(val.to_string());
                    } else if let Some(val) = other.strip_prefix("--rounds=") {
                        match val.parse() {
                            Ok(n) => opts.rounds = n,
                            Err(_) => {
                                return Err(ParseError::InvalidValue {
                                    flag: "--rounds",
                                    value: val.to_string(),
                                });
                            }
                        }
                    } else if let Some(val) = other.strip_prefix("--report=") {
                        if val.is_empty() {
                            return Err(ParseError::InvalidValue {
                                flag: "--report",
                                value: val.to_string(),
                            });
                        }
                        opts.report = Some(val.to_string());
                    } else {
                        return Err(ParseError::UnknownArg(other.to_string()));
                    }
                }
            }
        }

        Ok(opts)
    }
}
