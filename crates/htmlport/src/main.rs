use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use htmlport_core::config::{
    ConfigOverrides, DEFAULT_CONFIG_FILE, ExecutionMode, ImportConfig, load_config,
};
use htmlport_core::filesystem::{normalize_path, read_document, title_from_path};
use htmlport_core::frontmatter::extract_front_matter;
use htmlport_core::import::{ImportReport, discover_documents, run_import};
use htmlport_core::normalize::{NormalizeOptions, normalize_markup};
use htmlport_core::pagemap::PageMap;
use htmlport_core::rewrite::{RewriteContext, rewrite_references};
use htmlport_core::simulate::DRY_BASE_URL;
use htmlport_core::state::StateStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "htmlport",
    version,
    about = "Migrate a tree of HTML documents into a Confluence space"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import every pending document
    Import(ImportArgs),
    /// Print the storage markup one document converts to, without any remote call
    Convert(ConvertArgs),
    /// Show resolved settings and resume progress
    Status(SourceArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct SourceArgs {
    #[arg(long, value_name = "PATH", help = "Directory holding the documents")]
    root: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Index document listing the documents to import")]
    index: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Resume state file")]
    state_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, help = "Simulate remote calls with synthetic ids", conflicts_with = "dry_local")]
    dry_run: bool,
    #[arg(long, help = "Write page bodies and attachments to --output-dir instead of the network")]
    dry_local: bool,
    #[arg(long, value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long, value_name = "N", help = "Only process the first N pending documents")]
    limit: Option<usize>,
    #[arg(long, help = "Ignore resume state and resend every document")]
    full: bool,
    #[arg(long, value_name = "PATH", help = "Write the transfer log as CSV")]
    csv: Option<PathBuf>,
    #[arg(long, help = "Publish a summary page to the space when done")]
    publish_report: bool,
    #[arg(long, value_name = "ID", help = "Create new pages below this page")]
    parent_id: Option<String>,
    #[arg(long, value_name = "MS", help = "Pause between documents")]
    delay_ms: Option<u64>,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,
    #[arg(long, value_name = "PATH", help = "Index document used to resolve page links")]
    index: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let project_root = match &cli.project_root {
        Some(path) => path.clone(),
        None => env::current_dir().context("failed to resolve current directory")?,
    };
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| project_root.join(DEFAULT_CONFIG_FILE));

    match cli.command {
        Commands::Import(args) => run_import_command(&project_root, &config_path, args),
        Commands::Convert(args) => run_convert(args),
        Commands::Status(args) => run_status(&project_root, &config_path, args),
    }
}

fn resolve_config(
    project_root: &Path,
    config_path: &Path,
    overrides: &ConfigOverrides,
) -> Result<ImportConfig> {
    let file = load_config(config_path)?;
    Ok(ImportConfig::resolve(&file, overrides, project_root))
}

fn run_import_command(project_root: &Path, config_path: &Path, args: ImportArgs) -> Result<()> {
    let mode = if args.dry_local {
        ExecutionMode::DryLocal
    } else if args.dry_run {
        ExecutionMode::Dry
    } else {
        ExecutionMode::Normal
    };
    let overrides = ConfigOverrides {
        root: args.source.root,
        index: args.source.index,
        state_file: args.source.state_file,
        output_dir: args.output_dir,
        mode: Some(mode),
        limit: args.limit,
        full: args.full,
        report_csv: args.csv,
        publish_report: args.publish_report.then_some(true),
        parent_id: args.parent_id,
        document_delay_ms: args.delay_ms,
    };
    let config = resolve_config(project_root, config_path, &overrides)?;
    let report = run_import(&config)?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_import_report(&config, &report),
    }
    Ok(())
}

fn print_import_report(config: &ImportConfig, report: &ImportReport) {
    println!("import {}", if report.success { "complete" } else { "finished with errors" });
    println!("mode: {}", config.mode.as_str());
    println!("root: {}", normalize_path(&config.root));
    println!("state_file: {}", normalize_path(&config.state_file));
    println!("documents: {}", report.documents_total);
    println!("processed: {}", report.processed);
    println!("transferred: {}", report.transferred);
    println!("skipped: {}", report.skipped);
    println!("failed: {}", report.failed);
    println!("pages_created: {}", report.pages_created);
    println!("pages_updated: {}", report.pages_updated);
    println!("attachments_uploaded: {}", report.attachments_uploaded);
    println!("missing_assets: {}", report.missing_assets);
    println!("warnings: {}", report.warnings);
    println!("request_count: {}", report.request_count);
    if let Some(path) = &report.report_csv {
        println!("report_csv: {}", normalize_path(path));
    }
    if let Some(url) = &report.report_page_url {
        println!("report_page: {url}");
    }
    if !report.errors.is_empty() {
        println!("errors:");
        for error in &report.errors {
            println!("  - {error}");
        }
    }
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let raw = read_document(&args.file)?;
    let split = extract_front_matter(&raw);
    if let Some(warning) = &split.warning {
        tracing::warn!("front matter ignored: {warning}");
    }
    let page_map = match &args.index {
        Some(index) => PageMap::from_index_file(index)?,
        None => PageMap::new(),
    };
    let title = split
        .string_value("title")
        .unwrap_or_else(|| title_from_path(&args.file.to_string_lossy()));
    let base_dir = args
        .file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let normalized = normalize_markup(&split.body, &NormalizeOptions::default())?;
    let rewritten = rewrite_references(
        &normalized,
        &RewriteContext {
            title: &title,
            page_map: &page_map,
            base_dir: &base_dir,
            page_id: "preview",
            download_base: DRY_BASE_URL,
        },
    )?;

    println!("{}", rewritten.markup);
    for upload in &rewritten.uploads {
        tracing::info!(attachment = %upload, "would upload");
    }
    for diagnostic in &rewritten.diagnostics {
        tracing::warn!("{}", diagnostic.describe());
    }
    Ok(())
}

fn run_status(project_root: &Path, config_path: &Path, args: SourceArgs) -> Result<()> {
    let overrides = ConfigOverrides {
        root: args.root,
        index: args.index,
        state_file: args.state_file,
        mode: Some(ExecutionMode::Dry),
        ..ConfigOverrides::default()
    };
    let config = resolve_config(project_root, config_path, &overrides)?;
    config.validate()?;

    let state = StateStore::new(&config.state_file, false).load();
    let (_, documents) = discover_documents(&config)?;
    let pending = documents
        .iter()
        .filter(|document| !state.contains(&document.identity))
        .count();

    println!("htmlport status");
    println!("config_path: {}", normalize_path(config_path));
    println!("config_exists: {}", config_path.exists());
    println!("root: {}", normalize_path(&config.root));
    println!(
        "index: {}",
        config
            .index
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<scan>".to_string())
    );
    println!("state_file: {}", normalize_path(&config.state_file));
    println!(
        "base_url: {}",
        if config.confluence.base_url.is_empty() {
            "<unset>"
        } else {
            config.confluence.base_url.as_str()
        }
    );
    println!(
        "space_key: {}",
        if config.confluence.space_key.is_empty() {
            "<unset>"
        } else {
            config.confluence.space_key.as_str()
        }
    );
    println!("credentials: {}", config.confluence.auth.is_some());
    println!("documents: {}", documents.len());
    println!("transferred: {}", state.len());
    println!("pending: {pending}");
    Ok(())
}
