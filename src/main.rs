use clap::{Args as ClapArgs, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use hls_conformance::config::{self, RunnerConfig, RunnerSettings};
use hls_conformance::support::{self, CODEC_STRINGS, GridKind, MIME_TYPES, SupportGrid, TableProbe};
use hls_conformance::{
    AdHocSource, Backend, Catalog, Expected, Orchestrator, PairStatus, ReportTab, RunReport,
    Session, TestIndex, cleanup_old_sessions,
};

/// HLS Conformance - run HLS test manifests against playback backends
#[derive(Parser, Debug)]
#[command(
    name = "hls-conformance",
    about = "Run HLS conformance manifests against native, hls.js and Shaka Player backends",
    after_help = "ENVIRONMENT VARIABLES:\n\
        HLS_CONFORMANCE_CONCURRENCY    Pairs running at once during a full run\n\
        HLS_CONFORMANCE_TIMEOUT_MS     Deadline for one pair (ms)\n\
        HLS_CONFORMANCE_GRACE_MS       Playback time required before a pair passes (ms)\n\
        HLS_CONFORMANCE_BASE_URL       Base URL for relative manifests\n\
        HLS_CONFORMANCE_BACKENDS       Enabled backends, comma-separated\n\
        HLS_CONFORMANCE_SESSION_DIR    Base directory for sessions"
)]
struct Args {
    /// Log at debug level
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ClapArgs, Debug)]
struct RunnerArgs {
    /// JSON catalog file (default: built-in catalog)
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Pairs running at once during a full run
    #[arg(long, short = 'c', env = config::ENV_CONCURRENCY, default_value_t = config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Deadline for one pair (ms)
    #[arg(long, env = config::ENV_TIMEOUT_MS, default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Playback time required before a pair passes (ms)
    #[arg(long, env = config::ENV_GRACE_MS, default_value_t = config::DEFAULT_GRACE_MS)]
    grace_ms: u64,

    /// Base URL for relative manifest URIs
    #[arg(long, env = config::ENV_BASE_URL, default_value = config::DEFAULT_BASE_URL)]
    base_url: String,

    /// Enabled backends, comma-separated (native, hls.js, shaka-player)
    #[arg(long, short = 'b', env = config::ENV_BACKENDS, default_value = config::DEFAULT_BACKENDS)]
    backends: String,

    /// Fetch the text of captured playlists into the report
    #[arg(long)]
    manifests: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,

    /// Print every diagnostic tab for failing pairs
    #[arg(long)]
    details: bool,

    /// Output directory for the report and screenshots (default: auto-generated in session dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep the session after completion (default: cleanup unless --output is specified)
    #[arg(long, short = 'k')]
    keep: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every enabled test case on every enabled backend
    Run {
        #[command(flatten)]
        runner: RunnerArgs,

        /// Only run these pairs, as INDEX:BACKEND (e.g. "3:hls.js"); repeatable
        #[arg(long, value_parser = parse_pair)]
        only: Vec<(TestIndex, Backend)>,
    },

    /// List the test catalog
    List {
        /// JSON catalog file (default: built-in catalog)
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Add an ad-hoc manifest (URL or local file) and run it on every enabled backend
    Add {
        /// Manifest URL, or path to a local playlist
        source: String,

        #[command(flatten)]
        runner: RunnerArgs,
    },

    /// Print the MIME type x codec matrix
    Codecs {
        /// Support table captured from a browser ({"canPlayType": {...}, "isTypeSupported": {...}})
        #[arg(long)]
        support: Option<PathBuf>,
    },

    /// Remove old sessions from the session directory
    Clean {
        /// Remove sessions older than this many hours
        #[arg(long, default_value_t = 24)]
        older_than_hours: u64,
    },
}

fn parse_pair(raw: &str) -> Result<(TestIndex, Backend), String> {
    let (index, backend) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected INDEX:BACKEND, got '{}'", raw))?;
    let index: i64 = index
        .trim()
        .parse()
        .map_err(|_| format!("invalid test index '{}'", index))?;
    let backend: Backend = backend.parse().map_err(|e| format!("{}", e))?;
    Ok((TestIndex(index), backend))
}

fn load_catalog(path: Option<&PathBuf>) -> Result<Catalog, Box<dyn Error>> {
    Ok(match path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::builtin(),
    })
}

fn build_orchestrator(runner: &RunnerArgs) -> Result<Orchestrator, Box<dyn Error>> {
    let settings = RunnerSettings {
        concurrency: runner.concurrency,
        timeout_ms: runner.timeout_ms,
        grace_ms: runner.grace_ms,
        base_url: runner.base_url.clone(),
        backends: runner.backends.clone(),
    };
    let config = RunnerConfig::from_settings(&settings)?;
    let catalog = load_catalog(runner.catalog.as_ref())?;
    Ok(Orchestrator::new(config, catalog).with_probe_players())
}

fn open_session(runner: &RunnerArgs, name: &str) -> Result<Session, Box<dyn Error>> {
    let session = match &runner.output {
        Some(dir) => Session::in_dir(dir).keep(true),
        None => Session::with_name(name).keep(runner.keep),
    };
    session.init()?;
    Ok(session)
}

fn print_report(report: &RunReport, runner: &RunnerArgs, session: &Session) -> Result<(), Box<dyn Error>> {
    let report_path = session.write_report(report)?;
    let screenshots = session.write_screenshots(report)?;

    if runner.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    print!("{}", report.summary_table());
    if runner.details {
        for pair in report.pairs.iter().filter(|p| p.status == PairStatus::Fail) {
            println!("\n=== {} on {} ===", pair.test_name, pair.pair.backend.display_name());
            for tab in ReportTab::ALL {
                println!("--- {} ---", tab.title());
                println!("{}", pair.render_tab(tab).trim_end());
            }
        }
    }
    if runner.keep || runner.output.is_some() {
        println!("\nReport: {}", report_path.display());
        println!("Screenshots: {}", screenshots.len());
        println!("Session: {}", session.dir.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("hls_conformance=debug")
    } else {
        EnvFilter::new("hls_conformance=info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Some(Commands::Run { runner, only }) => {
            let mut orchestrator = build_orchestrator(&runner)?;
            let session = open_session(&runner, "run")?;

            if only.is_empty() {
                orchestrator.run_all()?;
            } else {
                for (index, backend) in only {
                    orchestrator.run_pair(index, backend)?;
                }
            }
            orchestrator.drain().await;

            let report = orchestrator.report(runner.manifests).await;
            print_report(&report, &runner, &session)?;
        }

        Some(Commands::List { catalog }) => {
            let catalog = load_catalog(catalog.as_ref())?;
            for (index, case) in catalog.iter() {
                let expected = match case.expected {
                    Expected::Pass => "",
                    Expected::Fail => " [expected fail]",
                };
                println!("{:>3}  {}{}", index.0, case.name, expected);
                println!("     {}", case.manifest_uri);
                if !case.description.is_empty() {
                    println!("     {}", case.description);
                }
            }
        }

        Some(Commands::Add { source, runner }) => {
            let mut orchestrator = build_orchestrator(&runner)?;
            let session = open_session(&runner, "adhoc")?;

            let path = PathBuf::from(&source);
            let source = if path.is_file() {
                AdHocSource::File(path)
            } else {
                AdHocSource::Uri(source)
            };
            let index = orchestrator.add_ad_hoc(source)?;
            orchestrator.drain().await;

            if !runner.json {
                println!("Ad-hoc test {}", index);
            }
            let report = orchestrator.report(runner.manifests).await;
            print_report(&report, &runner, &session)?;
        }

        Some(Commands::Codecs { support: table }) => match table {
            Some(path) => {
                let probe = TableProbe::load(&path)?;
                for kind in [GridKind::MediaSource, GridKind::MediaElement] {
                    let grid = SupportGrid::build(kind, &probe);
                    let (pass, maybe, fail) = grid.tally();
                    println!("{:?}: {} pass, {} maybe, {} fail", kind, pass, maybe, fail);
                    println!("{}", grid.render());
                }
            }
            None => {
                for mime in MIME_TYPES {
                    for codec in CODEC_STRINGS {
                        println!("{}", support::full_type(mime, codec));
                    }
                }
            }
        },

        Some(Commands::Clean { older_than_hours }) => {
            let max_age = Duration::from_secs(older_than_hours * 3600);
            let removed = cleanup_old_sessions(max_age)?;
            println!(
                "Removed {} session(s) from {}",
                removed,
                config::session_base_dir()
            );
        }

        None => {
            println!("HLS Conformance - run HLS test manifests against playback backends");
            println!();
            println!("Usage: hls-conformance <COMMAND>");
            println!();
            println!("Commands:");
            println!("  run     Run the catalog on every enabled backend");
            println!("  list    List the test catalog");
            println!("  add     Add an ad-hoc manifest and run it");
            println!("  codecs  Print the MIME type x codec matrix");
            println!("  clean   Remove old sessions");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}
