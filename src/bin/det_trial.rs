use std::io::{self, Write};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use crossterm::tty::IsTty;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use det_trial_cli::api::{MasterHttpClient, TrialLogQuery};
use det_trial_cli::app::{App, ProgressSink, TracingProgress};
use det_trial_cli::bundle::BundleRequest;
use det_trial_cli::config::{ConfigLoader, ConfigOverrides};
use det_trial_cli::domain::{LogLevel, Rfc3339, TrialId};
use det_trial_cli::error::DetError;
use det_trial_cli::output::{JsonOutput, OutputMode};
use det_trial_cli::render::{describe_text, format_log_line};

#[derive(Parser)]
#[command(name = "det-trial")]
#[command(about = "Inspect, stream, kill and collect support bundles for experiment trials")]
#[command(version, author)]
struct Cli {
    /// Master address (defaults to $DET_MASTER, then http://localhost:8080)
    #[arg(short, long, global = true)]
    master: Option<String>,

    /// User whose stored token is used (defaults to $DET_USER, then the active user)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Describe a trial")]
    Describe(DescribeArgs),
    #[command(about = "Fetch trial logs")]
    Logs(LogsArgs),
    #[command(about = "Forcibly terminate a trial")]
    Kill(TrialArgs),
    #[command(about = "Archive trial logs, master logs and API responses for support")]
    SupportBundle(SupportBundleArgs),
}

#[derive(Args)]
struct TrialArgs {
    /// Trial ID
    trial_id: TrialId,
}

#[derive(Args)]
struct DescribeArgs {
    /// Trial ID
    trial_id: TrialId,

    /// Display full workload metrics
    #[arg(long)]
    metrics: bool,

    /// Print as CSV
    #[arg(long)]
    csv: bool,
}

#[derive(Args)]
struct LogsArgs {
    /// Trial ID
    trial_id: TrialId,

    /// Follow the logs of a running trial, similar to tail -f
    #[arg(short, long)]
    follow: bool,

    /// Number of lines to show, counting from the beginning of the log
    #[arg(long, conflicts_with = "tail")]
    head: Option<u64>,

    /// Number of lines to show, counting from the end of the log
    #[arg(long)]
    tail: Option<u64>,

    /// Agents to show logs from (repeat for multiple values)
    #[arg(long = "agent-id")]
    agent_ids: Vec<String>,

    /// Containers to show logs from (repeat for multiple values)
    #[arg(long = "container-id")]
    container_ids: Vec<String>,

    /// Ranks to show logs from (repeat for multiple values)
    #[arg(long = "rank-id")]
    rank_ids: Vec<i64>,

    /// Sources to show logs from (repeat for multiple values)
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Output streams to show logs from (repeat for multiple values)
    #[arg(long = "stdtype")]
    stdtypes: Vec<String>,

    /// Show logs with this level or higher
    #[arg(long, value_enum, ignore_case = true)]
    level: Option<LogLevel>,

    /// Show logs only from before this RFC 3339 time, e.g. 2021-10-26T23:17:12Z
    #[arg(long)]
    timestamp_before: Option<Rfc3339>,

    /// Show logs only from after this RFC 3339 time
    #[arg(long)]
    timestamp_after: Option<Rfc3339>,
}

#[derive(Args)]
struct SupportBundleArgs {
    /// Trial ID
    trial_id: TrialId,

    /// Directory the bundle is written to (defaults to the current directory)
    #[arg(short, long)]
    output_dir: Option<Utf8PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DetError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DetError) -> u8 {
    match error {
        DetError::NotLoggedIn(_)
        | DetError::InvalidTrialId(_)
        | DetError::InvalidLogLevel(_)
        | DetError::InvalidTimestamp(_)
        | DetError::InvalidMaster(_)
        | DetError::InvalidQuery(_) => 2,
        error if error.is_not_found() => 2,
        DetError::MasterHttp(_) | DetError::MasterStatus { .. } | DetError::MasterStream(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(&ConfigOverrides {
        master: cli.master,
        user: cli.user,
    })?;
    let client = MasterHttpClient::new()?;
    let app = App::new(client, config.session());

    match cli.command {
        Commands::Describe(args) => run_describe(&app, args, output_mode),
        Commands::Logs(args) => run_logs(&app, args, output_mode),
        Commands::Kill(args) => run_kill(&app, args, output_mode),
        Commands::SupportBundle(args) => run_support_bundle(&app, args, output_mode),
    }
}

fn progress_sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Interactive => &TracingProgress,
    }
}

fn run_describe(
    app: &App<MasterHttpClient>,
    args: DescribeArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.describe(args.trial_id, progress_sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_describe(&result).into_diagnostic(),
        OutputMode::Interactive => {
            let text = describe_text(&result, args.metrics, args.csv)?;
            print!("{text}");
            Ok(())
        }
    }
}

fn run_logs(
    app: &App<MasterHttpClient>,
    args: LogsArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let query = TrialLogQuery {
        head: args.head,
        tail: args.tail,
        follow: args.follow,
        agent_ids: args.agent_ids,
        container_ids: args.container_ids,
        rank_ids: args.rank_ids,
        sources: args.sources,
        stdtypes: args.stdtypes,
        level: args.level,
        timestamp_before: args.timestamp_before,
        timestamp_after: args.timestamp_after,
    };
    let stream = app.logs(args.trial_id, &query)?;

    let colour = io::stdout().is_tty();
    let mut stdout = io::stdout().lock();
    for line in stream {
        let line = line?;
        let written = match output_mode {
            OutputMode::Json => serde_json::to_string(&line)
                .map_err(io::Error::other)
                .and_then(|json| writeln!(stdout, "{json}")),
            OutputMode::Interactive => write!(stdout, "{}", format_log_line(&line, colour)),
        };
        match written {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err).into_diagnostic(),
        }
        if args.follow {
            stdout.flush().into_diagnostic()?;
        }
    }
    stdout.flush().into_diagnostic()
}

fn run_kill(
    app: &App<MasterHttpClient>,
    args: TrialArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let result = app.kill(args.trial_id, progress_sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_kill(&result).into_diagnostic(),
        OutputMode::Interactive => {
            println!("Killed trial {}", result.trial_id);
            Ok(())
        }
    }
}

fn run_support_bundle(
    app: &App<MasterHttpClient>,
    args: SupportBundleArgs,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let request = BundleRequest {
        trial_id: args.trial_id,
        output_directory: args.output_dir,
    };
    let report = app.support_bundle(&request, progress_sink(output_mode))?;
    match output_mode {
        OutputMode::Json => JsonOutput::print_bundle(&report).into_diagnostic(),
        OutputMode::Interactive => {
            println!("{}", report.bundle.path);
            Ok(())
        }
    }
}
