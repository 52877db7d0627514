//! pkgstore CLI - Command line interface for the package store
//!
//! Each command opens the store, performs one operation and prints JSON to
//! stdout. Logs go to stderr (`RUST_LOG` controls verbosity).

use anyhow::Context;
use clap::{Parser, Subcommand};
use pkgstore::{PackageManager, PackageStore, StoreConfig};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pkgstore")]
#[command(about = "A package store keyed by user and version")]
#[command(version)]
struct Cli {
    /// Path to the store directory (overrides the config file)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init,

    /// Upload a package file
    Upload {
        /// File to upload, or "-" for stdin
        path: PathBuf,
        /// Owning user
        #[arg(short, long)]
        user: String,
        /// Version label, unique per user
        #[arg(long)]
        version: String,
        /// File name to record (defaults to the path's file name)
        #[arg(short, long)]
        name: Option<String>,
        /// Content type to record
        #[arg(short = 't', long)]
        content_type: Option<String>,
    },

    /// Show a package's metadata, including its content type
    Info {
        /// The package ID
        id: String,
    },

    /// Write a package's content to stdout or a file
    Cat {
        /// The package ID
        id: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List a user's packages, ordered by version
    List {
        /// The owning user
        #[arg(short, long)]
        user: String,
    },

    /// Show store status
    Status,
}

/// How a failed request is reported
#[derive(Clone, Copy)]
enum Failure {
    BadRequest,
    Conflict,
    NotFound,
}

impl Failure {
    fn kind(self) -> &'static str {
        match self {
            Failure::BadRequest => "bad_request",
            Failure::Conflict => "conflict",
            Failure::NotFound => "not_found",
        }
    }

    fn exit_code(self) -> ExitCode {
        match self {
            Failure::BadRequest => ExitCode::from(2),
            Failure::Conflict => ExitCode::from(3),
            Failure::NotFound => ExitCode::from(4),
        }
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli)?;

    match &cli.command {
        Commands::Init => {
            let store = PackageStore::open(&config)?;
            output(
                cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Initialized store at {}", store.root().display())
                }),
            );
        }

        Commands::Upload {
            path,
            user,
            version,
            name,
            content_type,
        } => {
            let manager = PackageManager::new(PackageStore::open(&config)?);
            let file_name = name.clone().unwrap_or_else(|| default_file_name(path));

            let source: Box<dyn Read> = if path.as_os_str() == "-" {
                Box::new(io::stdin().lock())
            } else {
                match File::open(path) {
                    Ok(file) => Box::new(file),
                    Err(e) => {
                        let message = format!("Cannot read {}: {}", path.display(), e);
                        return Ok(fail(cli.format, Failure::BadRequest, &message));
                    }
                }
            };

            match manager.save(&file_name, content_type.as_deref(), source, user, version) {
                Ok(info) => output(cli.format, &summary(&info)?),
                Err(e) if e.is_conflict() => {
                    return Ok(fail(cli.format, Failure::Conflict, &e.to_string()));
                }
                Err(e) if e.is_client_error() => {
                    return Ok(fail(cli.format, Failure::BadRequest, &e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Info { id } => {
            let manager = PackageManager::new(PackageStore::open(&config)?);
            match manager.find_metadata_by_id(id)? {
                Some(metadata) => output(cli.format, &summary(&metadata)?),
                None => return Ok(not_found(cli.format, id)),
            }
        }

        Commands::Cat { id, output: path } => {
            let manager = PackageManager::new(PackageStore::open(&config)?);
            let Some(stored) = manager.find_by_id(id)? else {
                return Ok(not_found(cli.format, id));
            };
            let content_type = stored.content_type.clone();
            let (info, mut content) = stored.into_parts();

            let copied = match path {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("Cannot create {}", path.display()))?;
                    copy_content(&mut content, file)?
                }
                None => copy_content(&mut content, io::stdout().lock())?,
            };
            if copied != info.size {
                anyhow::bail!(
                    "Package {} is {} bytes but {} were read",
                    info.id,
                    info.size,
                    copied
                );
            }

            if let Some(path) = path {
                output(
                    cli.format,
                    &serde_json::json!({
                        "status": "ok",
                        "id": info.id.to_string(),
                        "path": path.display().to_string(),
                        "size": copied,
                        "contentType": content_type
                    }),
                );
            }
        }

        Commands::List { user } => {
            let manager = PackageManager::new(PackageStore::open(&config)?);
            let packages = manager.list_all(user)?;
            output(cli.format, &summary(&packages)?);
        }

        Commands::Status => {
            let store = PackageStore::open(&config)?;
            let stats = store.stats()?;
            output(
                cli.format,
                &serde_json::json!({
                    "store": store.root().display().to_string(),
                    "compression_level": config.compression_level,
                    "packages": stats.packages,
                    "users": stats.users,
                    "total_bytes": stats.total_bytes
                }),
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> pkgstore::Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(store) = &cli.store {
        config.root = store.clone();
    }
    Ok(config)
}

fn default_file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| name != "-")
        .unwrap_or_else(|| "stdin".to_string())
}

fn copy_content(content: &mut impl Read, writer: impl Write) -> io::Result<u64> {
    let mut writer = BufWriter::new(writer);
    let copied = io::copy(content, &mut writer)?;
    writer.flush()?;
    Ok(copied)
}

fn summary(record: &impl Serialize) -> anyhow::Result<serde_json::Value> {
    serde_json::to_value(record).context("Cannot render package metadata")
}

fn not_found(format: OutputFormat, id: &str) -> ExitCode {
    fail(
        format,
        Failure::NotFound,
        &format!("Package not found: {}", id),
    )
}

fn fail(format: OutputFormat, failure: Failure, message: &str) -> ExitCode {
    output(
        format,
        &serde_json::json!({
            "status": "error",
            "kind": failure.kind(),
            "message": message
        }),
    );
    failure.exit_code()
}

fn output(format: OutputFormat, value: &serde_json::Value) {
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string(value),
        OutputFormat::Text => serde_json::to_string_pretty(value),
    };
    match rendered {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Error: failed to render output: {}", e),
    }
}
