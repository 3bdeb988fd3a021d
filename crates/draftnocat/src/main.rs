use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use draftnocat_core::batch::{ApiBatchSource, BatchQuery, ReplicaBatchSource};
use draftnocat_core::config::{BotConfig, load_config};
use draftnocat_core::mediawiki::{MediaWikiClient, MediaWikiClientConfig};
use draftnocat_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    normalize_for_display, resolve_paths,
};
use draftnocat_core::suppress::{count_live_categories, exemption_block, suppress_categories};
use draftnocat_core::task::{BatchReport, RunOptions, collect_batch, process_batch};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "draftnocat",
    version,
    about = "Disable article categories on drafts and user-space pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Increase log verbosity (-v debug, -vv trace)")]
    verbose: u8,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Process the tracking category once and exit")]
    Run(RunArgs),
    #[command(about = "Apply the category transform to a file (or stdin) and print the result")]
    Transform(TransformArgs),
    #[command(about = "Write the default configuration under .draftnocat/")]
    Init(InitArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    Replica,
    Api,
}

impl SourceKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Replica => "replica",
            Self::Api => "api",
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, help = "Report the changes without saving them")]
    dry: bool,
    #[arg(long, help = "Stop at the first page that fails")]
    fail_fast: bool,
    #[arg(long, value_name = "N", help = "Process at most N pages")]
    limit: Option<usize>,
    #[arg(long, value_enum, default_value_t = SourceKind::Replica, help = "Where the page list comes from")]
    source: SourceKind,
    #[arg(long, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct TransformArgs {
    #[arg(value_name = "PATH", help = "Wikitext file to read; stdin when omitted")]
    path: Option<PathBuf>,
    #[arg(long, help = "Print a summary instead of the transformed text")]
    summary: bool,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Some(Commands::Run(ref args)) => run_batch(&cli, args),
        Some(Commands::Transform(ref args)) => run_transform(args),
        Some(Commands::Init(ref args)) => run_init(&cli, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

fn run_batch(cli: &Cli, args: &RunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(cli)?;
    let config = load_config(&paths.config_path)?;
    if cli.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }

    let mut client = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config)?)?;
    let query = BatchQuery::from_config(&config);
    let (source_label, rows) = match args.source {
        SourceKind::Replica => {
            let db_path = config.replica_db_path(&paths.project_root, &paths.state_dir);
            let mut source = ReplicaBatchSource::new(db_path);
            let label = normalize_for_display(source.db_path());
            (label, collect_batch(&mut source, &query, args.limit)?)
        }
        SourceKind::Api => {
            let mut source = ApiBatchSource::new(&mut client);
            (
                "categorymembers".to_string(),
                collect_batch(&mut source, &query, args.limit)?,
            )
        }
    };

    let credentials = bot_credentials();
    let options = RunOptions::from_config(&config, args.dry, args.fail_fast);
    let report = process_batch(
        &mut client,
        &rows,
        &options,
        credentials
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str())),
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&config, args.source, &source_label, &report);
    }
    info!(
        processed = report.processed,
        failed = report.failed,
        "Task complete!"
    );

    if !report.success {
        bail!(
            "{} of {} pages failed{}",
            report.failed,
            report.candidates,
            if report.aborted {
                " (run aborted by --fail-fast)"
            } else {
                ""
            }
        );
    }
    Ok(())
}

fn run_transform(args: &TransformArgs) -> Result<()> {
    let input = match &args.path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => io::read_to_string(io::stdin()).context("failed to read stdin")?,
    };
    let output = suppress_categories(&input);

    if args.summary {
        println!("transform");
        println!(
            "source: {}",
            args.path
                .as_deref()
                .map(normalize_for_display)
                .unwrap_or_else(|| "<stdin>".to_string())
        );
        println!("live_categories: {}", count_live_categories(&input));
        println!("exemption_block: {}", format_flag(exemption_block(&input).is_some()));
        println!("changed: {}", format_flag(output != input));
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .context("failed to write transformed text")?;
    stdout.flush().context("failed to flush stdout")?;
    Ok(())
}

fn run_init(cli: &Cli, args: &InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(cli)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized draftnocat runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    if !report.wrote_config {
        println!("hint: config already exists (use --force to overwrite)");
    }
    if cli.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
    Ok(())
}

fn print_report(config: &BotConfig, source: SourceKind, source_label: &str, report: &BatchReport) {
    println!("run report");
    println!("source: {} ({source_label})", source.as_str());
    println!("category: {}", config.category());
    println!(
        "namespaces: {}",
        config
            .namespaces()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("dry_run: {}", format_flag(report.dry_run));
    println!("candidates: {}", report.candidates);
    println!("processed: {}", report.processed);
    println!("updated: {}", report.updated);
    println!("would_update: {}", report.would_update);
    println!("unchanged: {}", report.unchanged);
    println!("skipped: {}", report.skipped);
    println!("failed: {}", report.failed);
    println!("aborted: {}", format_flag(report.aborted));
    println!("request_count: {}", report.request_count);

    if report.pages.is_empty() {
        println!("pages: <none>");
    }
    for page in &report.pages {
        match &page.detail {
            Some(detail) => println!(
                "page.{}: {} [{} suppressed] ({detail})",
                page.action.as_str(),
                page.title,
                page.suppressed
            ),
            None => println!(
                "page.{}: {} [{} suppressed]",
                page.action.as_str(),
                page.title,
                page.suppressed
            ),
        }
        if let Some(diff) = &page.diff {
            print!("{diff}");
        }
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn bot_credentials() -> Option<(String, String)> {
    let username = env::var("WIKI_BOT_USER").ok()?;
    let password = env::var("WIKI_BOT_PASS").ok()?;
    let username = username.trim();
    let password = password.trim();
    if username.is_empty() || password.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

fn resolve_runtime_paths(cli: &Cli) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: cli.project_root.clone(),
        config: cli.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
