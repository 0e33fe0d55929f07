use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use clap::{Args, CommandFactory, Parser, Subcommand};
use colored::*;

use crate::analyzer::Status;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{BenchError, Result};
use crate::model::Run;
use crate::persist::{load_catalog, open_for_path};
use crate::pipeline::{short_id, IngestionPipeline, Report};
use crate::sink::{LogSink, MarkdownSink};

#[derive(Parser, Debug)]
#[command(name = "benchwatch")]
#[command(version)]
#[command(about = "Continuous benchmark tracking with noise-tolerant regression detection")]
pub struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest one run and report regressions
    Ingest(IngestArgs),

    /// Print the stored history of one benchmark
    History {
        /// Catalog file (.json, .js or .db)
        #[arg(long)]
        data: PathBuf,

        /// Benchmark name
        #[arg(long)]
        name: String,

        /// Suite to read (defaults to the configured suite)
        #[arg(long)]
        suite: Option<String>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List benchmark names
    Names {
        /// Catalog file (.json, .js or .db)
        #[arg(long)]
        data: PathBuf,

        /// Suite to read (defaults to the configured suite)
        #[arg(long)]
        suite: Option<String>,

        /// TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Catalog file (.json, .js or .db); created on first save
    #[arg(long)]
    pub data: PathBuf,

    /// Run JSON (`{commit, date, tool, benches}`), `-` for stdin
    #[arg(long)]
    pub run: PathBuf,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Suite to ingest into (defaults to the configured suite)
    #[arg(long)]
    pub suite: Option<String>,

    /// Also write a Markdown report to this path
    #[arg(long)]
    pub markdown: Option<PathBuf>,

    /// Exit with status 1 when any benchmark regressed
    #[arg(long)]
    pub fail_on_alert: bool,
}

/// Run a parsed command, writing human output to `out`. Returns the exit code.
pub fn execute(cli: Cli, out: &mut dyn Write) -> Result<u8> {
    match cli.command {
        Command::Ingest(args) => ingest(args, out),
        Command::History { data, name, suite, config } => {
            let config = Config::load(config.as_deref())?;
            let catalog = open_catalog(&data, &config)?;
            let suite = suite.unwrap_or_else(|| config.suite.clone());
            print_history(&catalog, &suite, &name, out)?;
            Ok(0)
        }
        Command::Names { data, suite, config } => {
            let config = Config::load(config.as_deref())?;
            let catalog = open_catalog(&data, &config)?;
            let suite = suite.unwrap_or_else(|| config.suite.clone());
            if let Some(store) = catalog.suite(&suite) {
                for name in store.names() {
                    writeln!(out, "{}", name)?;
                }
            }
            Ok(0)
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "benchwatch", out);
            Ok(0)
        }
    }
}

fn ingest(args: IngestArgs, out: &mut dyn Write) -> Result<u8> {
    let config = Config::load(args.config.as_deref())?;
    let mut pipeline = IngestionPipeline::open(config, open_for_path(&args.data)?)?;
    pipeline.add_sink(Box::new(LogSink));
    if let Some(path) = &args.markdown {
        pipeline.add_sink(Box::new(MarkdownSink::to_path(path)));
    }

    let run = read_run(&args.run)?;
    let suite = args.suite.unwrap_or_else(|| pipeline.config().suite.clone());
    let report = pipeline.ingest_into(&suite, run)?;
    print_report(&report, out)?;

    Ok(if args.fail_on_alert && report.has_alerts() { 1 } else { 0 })
}

fn open_catalog(data: &Path, config: &Config) -> Result<Catalog> {
    let persistence = open_for_path(data)?;
    load_catalog(&*persistence, config.backfill_policy(), &config.repo_url)
}

fn read_run(path: &Path) -> Result<Run> {
    let text = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Ok(serde_json::from_str(&text)?)
}

fn colored_status(status: &Status) -> ColoredString {
    match status {
        Status::Regressed { .. } => status.to_string().red().bold(),
        Status::Improved => status.to_string().green(),
        Status::WithinNoise => status.to_string().normal(),
        Status::InsufficientData => status.to_string().dimmed(),
    }
}

pub fn print_report(report: &Report, out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "{} {} [{}]: {}",
        "commit".bold(),
        short_id(&report.commit),
        report.suite,
        report.outcome
    )?;
    for result in &report.results {
        let change = match result.relative_change() {
            Some(r) if r.is_finite() => format!("{:+.1}%", r * 100.0),
            _ => "-".to_string(),
        };
        writeln!(
            out,
            "  {:<32} {:>14} ± {:<10} {:<10} {:>9}  {}",
            result.name,
            result.value,
            result.error,
            result.unit,
            change,
            colored_status(&result.status())
        )?;
    }
    for failure in &report.append_failures {
        writeln!(out, "  {} {}", "not recorded:".yellow(), failure.error)?;
    }
    if report.has_alerts() {
        writeln!(
            out,
            "{}",
            format!("{} benchmark(s) regressed", report.alerts().len()).red().bold()
        )?;
    }
    Ok(())
}

fn print_history(catalog: &Catalog, suite: &str, name: &str, out: &mut dyn Write) -> Result<()> {
    let history = catalog
        .suite(suite)
        .and_then(|store| store.history(name))
        .ok_or_else(|| {
            BenchError::validation(format!("no benchmark `{}` in suite `{}`", name, suite))
        })?;
    for record in &history {
        let marker = if record.run.is_distinct() { " " } else { "*" };
        writeln!(
            out,
            "{}{} {} {:>14} ± {:<10} {}",
            marker,
            short_id(record.commit_id()),
            record.timestamp().to_rfc3339(),
            record.value,
            record.error,
            record.unit
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_ingest_minimal() {
        let cli = Cli::parse_from(["benchwatch", "ingest", "--data", "data.js", "--run", "run.json"]);
        match cli.command {
            Command::Ingest(args) => {
                assert_eq!(args.data, PathBuf::from("data.js"));
                assert_eq!(args.run, PathBuf::from("run.json"));
                assert!(args.config.is_none());
                assert!(args.suite.is_none());
                assert!(!args.fail_on_alert);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_parse_ingest_full() {
        let cli = Cli::parse_from([
            "benchwatch",
            "-v",
            "ingest",
            "--data",
            "bench.db",
            "--run",
            "-",
            "--config",
            "benchwatch.toml",
            "--suite",
            "cpu",
            "--markdown",
            "alert.md",
            "--fail-on-alert",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Command::Ingest(args) => {
                assert_eq!(args.suite.as_deref(), Some("cpu"));
                assert_eq!(args.markdown, Some(PathBuf::from("alert.md")));
                assert!(args.fail_on_alert);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cli_parse_history() {
        let cli = Cli::parse_from(["benchwatch", "history", "--data", "d.json", "--name", "fib_15"]);
        assert!(matches!(cli.command, Command::History { ref name, .. } if name == "fib_15"));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["benchwatch"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_completions_written() {
        let cli = Cli::parse_from(["benchwatch", "completions", "bash"]);
        let mut buf = Vec::new();
        assert_eq!(execute(cli, &mut buf).unwrap(), 0);
        assert!(String::from_utf8(buf).unwrap().contains("benchwatch"));
    }
}
