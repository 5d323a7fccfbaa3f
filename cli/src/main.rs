//! classbench CLI - run a single LSP query against a language server.
//!
//! ```text
//! main() -> load_config() -> Bridge::start() -> run_query() -> Bridge::shutdown()
//!                                                   |
//!                                                   v
//!                                        JSON result on stdout
//! ```
//!
//! Logs go to stderr (filter with `RUST_LOG`) so stdout carries only the
//! JSON result.

mod config;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use classbench_lsp::{Bridge, HandlerRegistry, Position};

/// Probe a language server the way the benchmark harness does
#[derive(Parser, Debug)]
#[command(name = "classbench")]
#[command(about = "Run one LSP query against a configured language server", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML client configuration
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    #[command(subcommand)]
    query: Query,
}

#[derive(Subcommand, Debug)]
enum Query {
    /// Completion items at a position
    Complete {
        #[command(flatten)]
        at: At,

        /// Accept a list the server marks as incomplete
        #[arg(long)]
        allow_incomplete: bool,
    },
    /// Signature help at a position
    Signature {
        #[command(flatten)]
        at: At,
    },
    /// Definition locations at a position
    Definition {
        #[command(flatten)]
        at: At,
    },
    /// Diagnostics for a file
    Diagnostics {
        file: PathBuf,

        /// Text to evaluate in place of the file contents
        #[arg(long, value_name = "PATH")]
        probe: Option<PathBuf>,

        /// How long to wait for published diagnostics
        #[arg(long, value_name = "SECS", default_value_t = 10)]
        wait: u64,
    },
}

#[derive(Args, Debug)]
struct At {
    file: PathBuf,
    /// Zero-based line
    line: u32,
    /// Zero-based UTF-16 character offset
    character: u32,

    /// Text to evaluate in place of the file contents
    #[arg(long, value_name = "PATH")]
    probe: Option<PathBuf>,
}

impl At {
    fn position(&self) -> Position {
        Position::new(self.line, self.character)
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn read_probe(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p).with_context(|| format!("reading probe {}", p.display()))
    })
    .transpose()
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}

fn run_query(bridge: &Bridge, query: &Query) -> Result<Value> {
    let items = match query {
        Query::Complete {
            at,
            allow_incomplete,
        } => {
            let probe = read_probe(at.probe.as_deref())?;
            bridge.completions(
                &absolute(&at.file)?,
                probe.as_deref(),
                at.position(),
                *allow_incomplete,
            )?
        }
        Query::Signature { at } => {
            let probe = read_probe(at.probe.as_deref())?;
            bridge.signature_help(&absolute(&at.file)?, probe.as_deref(), at.position())?
        }
        Query::Definition { at } => {
            let probe = read_probe(at.probe.as_deref())?;
            bridge.definition(&absolute(&at.file)?, probe.as_deref(), at.position())?
        }
        Query::Diagnostics { file, probe, wait } => {
            let probe = read_probe(probe.as_deref())?;
            bridge.diagnostics(
                &absolute(file)?,
                probe.as_deref(),
                Duration::from_secs(*wait),
            )?
        }
    };
    Ok(Value::Array(items))
}

fn run(cli: &Cli) -> Result<String> {
    let config = config::load_config(&cli.config)?;
    let command = config.server.command.clone();
    let bridge = Bridge::start(config, HandlerRegistry::new())
        .with_context(|| format!("starting language server '{command}'"))?;

    let result = run_query(&bridge, &cli.query);
    bridge.shutdown();

    Ok(serde_json::to_string_pretty(&result?)?)
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_complete() {
        let cli = Cli::try_parse_from([
            "classbench",
            "--config",
            "c.toml",
            "complete",
            "Main.java",
            "3",
            "14",
            "--probe",
            "probe.java",
            "--allow-incomplete",
        ])
        .unwrap();
        match cli.query {
            Query::Complete {
                at,
                allow_incomplete,
            } => {
                assert_eq!(at.position(), Position::new(3, 14));
                assert_eq!(at.probe, Some(PathBuf::from("probe.java")));
                assert!(allow_incomplete);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_diagnostics_default_wait() {
        let cli =
            Cli::try_parse_from(["classbench", "--config", "c.toml", "diagnostics", "A.java"])
                .unwrap();
        match cli.query {
            Query::Diagnostics { wait, probe, .. } => {
                assert_eq!(wait, 10);
                assert!(probe.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_config_flag_rejected() {
        assert!(Cli::try_parse_from(["classbench", "signature", "A.java", "1", "2"]).is_err());
    }

    #[test]
    fn test_read_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.java");
        std::fs::write(&path, "class P {}").unwrap();
        assert_eq!(read_probe(Some(&path)).unwrap().as_deref(), Some("class P {}"));
        assert!(read_probe(None).unwrap().is_none());
        assert!(read_probe(Some(&dir.path().join("missing"))).is_err());
    }
}
