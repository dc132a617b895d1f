use std::fs;
use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use wekeo_broker::app::{App, RunOptions, RunResult};
use wekeo_broker::auth::{BrokerLogin, StaticToken, TokenProvider};
use wekeo_broker::broker::BrokerHttpClient;
use wekeo_broker::cancel::CancellationToken;
use wekeo_broker::catalog::{Catalog, multi_select_values};
use wekeo_broker::config::{ConfigLoader, ResolvedConfig};
use wekeo_broker::domain::{Credential, JobHandle, MaterializeMode, TerminalStatus};
use wekeo_broker::error::WekeoError;
use wekeo_broker::output::{JsonOutput, OutputMode, TerminalProgress};
use wekeo_broker::poller::{Backoff, JobPoller};
use wekeo_broker::progress::ProgressSink;
use wekeo_broker::query::{PRESET_NAMES, QueryDocument, QueryTemplate, Selections};

#[derive(Parser)]
#[command(name = "wekeo")]
#[command(about = "Submit, track and download WEkEO data broker requests")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    config: Option<String>,

    /// Access token; overrides config and WEKEO_TOKEN.
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Request an access token with username and password")]
    Token,
    #[command(about = "List catalog datasets")]
    Datasets(DatasetsArgs),
    #[command(about = "Show query metadata for a dataset")]
    Metadata(MetadataArgs),
    #[command(about = "Submit a data request and print its job id")]
    Submit(QueryArgs),
    #[command(about = "Check the status of a job once")]
    Status(JobArgs),
    #[command(about = "Wait until a job reaches a terminal state")]
    Wait(WaitArgs),
    #[command(about = "Print the result manifest of a completed job")]
    Resolve(JobArgs),
    #[command(about = "Place a data order for a completed job")]
    Order(JobArgs),
    #[command(about = "Wait for an existing job and materialize its result")]
    Collect(CollectArgs),
    #[command(about = "Submit, wait, resolve and materialize in one go")]
    Fetch(FetchArgs),
}

#[derive(Args)]
struct DatasetsArgs {
    #[arg(long, default_value_t = 1000)]
    size: usize,

    /// Case-insensitive substring of the dataset id.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Args)]
struct MetadataArgs {
    dataset_id: String,

    /// Only print the values of the first multi-select parameter.
    #[arg(long)]
    variables: bool,
}

#[derive(Args, Clone)]
struct QueryArgs {
    /// Path to a complete query document in JSON.
    #[arg(long, conflicts_with_all = ["preset", "selections"])]
    query: Option<String>,

    #[arg(long, requires = "selections")]
    preset: Option<String>,

    /// Path to a JSON object with the preset's selections.
    #[arg(long)]
    selections: Option<String>,

    /// Overrides the preset's dataset id.
    #[arg(long)]
    dataset_id: Option<String>,
}

#[derive(Args)]
struct JobArgs {
    job_id: String,
}

#[derive(Args, Clone)]
struct PollArgs {
    /// Give up after this many seconds.
    #[arg(long)]
    deadline: Option<u64>,

    /// Fixed interval between status checks, in seconds.
    #[arg(long)]
    interval: Option<f64>,
}

#[derive(Args)]
struct WaitArgs {
    job_id: String,

    #[command(flatten)]
    poll: PollArgs,
}

#[derive(Args, Clone)]
struct MaterializeArgs {
    #[arg(long, value_enum, default_value_t = MaterializeMode::ToFile)]
    mode: MaterializeMode,

    #[arg(long)]
    output_dir: Option<String>,

    /// Place a data order before downloading.
    #[arg(long)]
    order: bool,
}

#[derive(Args)]
struct CollectArgs {
    job_id: String,

    #[command(flatten)]
    poll: PollArgs,

    #[command(flatten)]
    materialize: MaterializeArgs,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    query: QueryArgs,

    #[command(flatten)]
    poll: PollArgs,

    #[command(flatten)]
    materialize: MaterializeArgs,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<WekeoError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &WekeoError) -> u8 {
    match error {
        WekeoError::MissingConfig(_)
        | WekeoError::ConfigRead(_)
        | WekeoError::ConfigParse(_)
        | WekeoError::MissingCredential(_)
        | WekeoError::InvalidJobHandle(_)
        | WekeoError::InvalidQuery(_) => 2,
        WekeoError::Auth { .. } => 3,
        WekeoError::Submission { .. }
        | WekeoError::PollTransport(_)
        | WekeoError::MalformedStatus(_)
        | WekeoError::Manifest(_)
        | WekeoError::Order { .. }
        | WekeoError::BrokerHttp(_)
        | WekeoError::BrokerStatus { .. } => 4,
        WekeoError::Filesystem(_) | WekeoError::Decode(_) => 5,
    }
}

fn outcome_exit_code(status: TerminalStatus) -> ExitCode {
    match status {
        TerminalStatus::Completed => ExitCode::SUCCESS,
        TerminalStatus::Failed => ExitCode::from(6),
        TerminalStatus::TimedOut => ExitCode::from(7),
        TerminalStatus::Cancelled => ExitCode::from(130),
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    let client = BrokerHttpClient::new(&config.broker_url, config.request_timeout)?;

    match cli.command {
        Commands::Token => {
            let login = config.login.as_ref().ok_or_else(|| {
                WekeoError::MissingCredential("username and password are required".to_string())
            })?;
            let credential = BrokerLogin::new(&client, &login.username, &login.password)
                .with_scheme(config.auth_scheme)
                .credential()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print(&serde_json::json!({
                    "access_token": credential.token()
                }))
                .into_diagnostic()?,
                OutputMode::Interactive => println!("Your access token is: {}", credential.token()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Datasets(args) => {
            let catalog = Catalog::new(&client);
            let datasets = match args.name.as_deref() {
                Some(name) => catalog.search(args.size, name)?,
                None => catalog.list(args.size)?,
            };
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print(&datasets).into_diagnostic()?,
                OutputMode::Interactive => {
                    for dataset in &datasets {
                        println!("{}", dataset.dataset_id);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Metadata(args) => {
            let credential = session_credential(&config, &client)?;
            let metadata = Catalog::new(&client).metadata(&args.dataset_id, &credential)?;
            if args.variables {
                let values = multi_select_values(&metadata);
                match output_mode {
                    OutputMode::NonInteractive => JsonOutput::print(&values).into_diagnostic()?,
                    OutputMode::Interactive => values.iter().for_each(|value| println!("{value}")),
                }
            } else {
                JsonOutput::print(&metadata).into_diagnostic()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Submit(args) => {
            let query = load_query(&args)?;
            let credential = session_credential(&config, &client)?;
            let app = App::new(client, config.poll, config.output_dir.clone());
            let progress = progress_sink(output_mode);
            let job = app.submit(&query, &credential, progress.as_ref())?;
            print_job(output_mode, &job)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status(args) => {
            let job: JobHandle = args.job_id.parse()?;
            let credential = session_credential(&config, &client)?;
            let status = JobPoller::new(&client, config.poll).check(&job, &credential)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print(&serde_json::json!({
                    "job_id": job.as_str(),
                    "status": status.to_string(),
                }))
                .into_diagnostic()?,
                OutputMode::Interactive => println!("Download status: {status}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Wait(args) => {
            let job: JobHandle = args.job_id.parse()?;
            let credential = session_credential(&config, &client)?;
            apply_poll_args(&mut config, &args.poll)?;
            let app = App::new(client, config.poll, config.output_dir.clone());
            let cancel = interrupt_token()?;
            let progress = progress_sink(output_mode);
            let outcome = app.wait(&job, &credential, &cancel, progress.as_ref())?;
            if matches!(output_mode, OutputMode::NonInteractive) {
                JsonOutput::print(&outcome).into_diagnostic()?;
            }
            Ok(outcome_exit_code(outcome.status))
        }
        Commands::Resolve(args) => {
            let job: JobHandle = args.job_id.parse()?;
            let credential = session_credential(&config, &client)?;
            let app = App::new(client, config.poll, config.output_dir.clone());
            let progress = progress_sink(output_mode);
            let manifest = app.resolve(&job, &credential, progress.as_ref())?;
            if matches!(output_mode, OutputMode::NonInteractive) {
                JsonOutput::print(&manifest).into_diagnostic()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Order(args) => {
            let job: JobHandle = args.job_id.parse()?;
            let credential = session_credential(&config, &client)?;
            let app = App::new(client, config.poll, config.output_dir.clone());
            let progress = progress_sink(output_mode);
            let manifest = app.resolve(&job, &credential, progress.as_ref())?;
            let order_id = app.order(&job, &manifest, &credential)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print(&serde_json::json!({ "order_id": order_id }))
                        .into_diagnostic()?
                }
                OutputMode::Interactive => println!("Order placed: {order_id}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Collect(args) => {
            let job: JobHandle = args.job_id.parse()?;
            let credential = session_credential(&config, &client)?;
            apply_poll_args(&mut config, &args.poll)?;
            let options = run_options(&mut config, &args.materialize);
            let app = App::new(client, config.poll, config.output_dir.clone());
            let cancel = interrupt_token()?;
            let progress = progress_sink(output_mode);
            let result = app.complete(job, &credential, &options, &cancel, progress.as_ref())?;
            report_run(output_mode, &result)
        }
        Commands::Fetch(args) => {
            let query = load_query(&args.query)?;
            let credential = session_credential(&config, &client)?;
            apply_poll_args(&mut config, &args.poll)?;
            let options = run_options(&mut config, &args.materialize);
            let app = App::new(client, config.poll, config.output_dir.clone());
            let cancel = interrupt_token()?;
            let progress = progress_sink(output_mode);
            let result = app.run(&query, &credential, &options, &cancel, progress.as_ref())?;
            report_run(output_mode, &result)
        }
    }
}

fn session_credential(
    config: &ResolvedConfig,
    client: &BrokerHttpClient,
) -> Result<Credential, WekeoError> {
    if let Some(credential) = config.static_credential() {
        return StaticToken(credential).credential();
    }
    match &config.login {
        Some(login) => BrokerLogin::new(client, &login.username, &login.password)
            .with_scheme(config.auth_scheme)
            .credential(),
        None => Err(WekeoError::MissingCredential(
            "no token and no username/password configured".to_string(),
        )),
    }
}

fn load_query(args: &QueryArgs) -> miette::Result<QueryDocument> {
    if let Some(path) = &args.query {
        let content = fs::read_to_string(path)
            .map_err(|err| WekeoError::Filesystem(format!("read {path}: {err}")))?;
        let mut query: QueryDocument = serde_json::from_str(&content)
            .map_err(|err| WekeoError::InvalidQuery(format!("{path}: {err}")))?;
        if let Some(dataset_id) = &args.dataset_id {
            query.dataset_id = dataset_id.clone();
        }
        return Ok(query);
    }

    let preset = args.preset.as_deref().ok_or_else(|| {
        WekeoError::InvalidQuery("either --query or --preset is required".to_string())
    })?;
    let mut template = QueryTemplate::preset(preset).ok_or_else(|| {
        WekeoError::InvalidQuery(format!(
            "unknown preset {preset:?} (available: {})",
            PRESET_NAMES.join(", ")
        ))
    })?;
    if let Some(dataset_id) = &args.dataset_id {
        template = template.with_dataset_id(dataset_id.clone());
    }
    let selections_path = args
        .selections
        .as_deref()
        .ok_or_else(|| WekeoError::InvalidQuery("--selections is required".to_string()))?;
    let content = fs::read_to_string(selections_path)
        .map_err(|err| WekeoError::Filesystem(format!("read {selections_path}: {err}")))?;
    let selections: Selections = serde_json::from_str(&content)
        .map_err(|err| WekeoError::InvalidQuery(format!("{selections_path}: {err}")))?;
    Ok(template.build(&selections)?)
}

fn apply_poll_args(config: &mut ResolvedConfig, args: &PollArgs) -> Result<(), WekeoError> {
    if let Some(deadline) = args.deadline {
        config.poll.deadline = Some(Duration::from_secs(deadline));
    }
    if let Some(interval) = args.interval {
        if !interval.is_finite() || interval < 0.0 {
            return Err(WekeoError::ConfigParse(format!(
                "--interval must be a non-negative number, got {interval}"
            )));
        }
        let interval = Duration::try_from_secs_f64(interval).map_err(|err| {
            WekeoError::ConfigParse(format!("--interval is out of range: {err}"))
        })?;
        config.poll.backoff = Backoff::Fixed(interval);
    }
    Ok(())
}

fn run_options(config: &mut ResolvedConfig, args: &MaterializeArgs) -> RunOptions {
    if let Some(dir) = &args.output_dir {
        config.output_dir = Utf8PathBuf::from(dir);
    }
    RunOptions {
        mode: args.mode,
        order: args.order,
    }
}

fn interrupt_token() -> miette::Result<CancellationToken> {
    let cancel = CancellationToken::new();
    cancel.install_signal_handler().into_diagnostic()?;
    Ok(cancel)
}

fn progress_sink(output_mode: OutputMode) -> Box<dyn ProgressSink> {
    match output_mode {
        OutputMode::Interactive => Box::new(TerminalProgress::new()),
        OutputMode::NonInteractive => Box::new(JsonOutput),
    }
}

fn print_job(output_mode: OutputMode, job: &JobHandle) -> miette::Result<()> {
    match output_mode {
        OutputMode::NonInteractive => {
            JsonOutput::print(&serde_json::json!({ "job_id": job.as_str() })).into_diagnostic()
        }
        OutputMode::Interactive => {
            println!("{job}");
            Ok(())
        }
    }
}

fn report_run(output_mode: OutputMode, result: &RunResult) -> miette::Result<ExitCode> {
    let summary = result.summary();
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print(&summary).into_diagnostic()?,
        OutputMode::Interactive => {
            println!("job:    {}", summary.job_id);
            println!("status: {}", summary.status);
            if let Some(location) = &summary.location {
                println!("saved:  {location}");
            }
            if !summary.dimensions.is_empty() {
                println!("dimensions: {}", summary.dimensions.join(", "));
            }
            if !summary.variables.is_empty() {
                println!("variables:  {}", summary.variables.join(", "));
            }
        }
    }
    Ok(outcome_exit_code(summary.status))
}
