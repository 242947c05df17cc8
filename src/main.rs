//! secure_transfer CLI - Move files in and out of a project data platform.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glob::glob;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_transfer::config::mask_key;
use secure_transfer::ident::validate_project;
use secure_transfer::models::format_size;
use secure_transfer::{
    Authenticator, Environment, ExportManager, FileApiClient, Operation, Registry,
    ResumableCoordinator, SessionStore, Settings, TerminalPrompt, TransferError, TransferPolicy,
    UploadOutcome,
};

const MIB: u64 = 1024 * 1024;

/// CLI tool for importing and exporting project data.
#[derive(Parser)]
#[command(name = "secure_transfer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// API environment (prod, alt or test).
    #[arg(long = "env", env = "SECURE_TRANSFER_ENV", default_value = "prod", global = true)]
    environment: Environment,

    /// Project identifier, e.g. p11.
    #[arg(long, short = 'p', env = "SECURE_TRANSFER_PROJECT", global = true)]
    project: Option<String>,

    /// Override the API base URL of the environment.
    #[arg(long, env = "SECURE_TRANSFER_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Directory holding the client registration and login sessions.
    #[arg(long, env = "SECURE_TRANSFER_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Authenticate with the API key only (imports only).
    #[arg(long, global = true)]
    basic: bool,

    /// Chunk size for resumable uploads, in MiB.
    #[arg(long, env = "SECURE_TRANSFER_CHUNK_MIB", default_value_t = 50, global = true)]
    chunk_mib: u64,

    /// Files larger than this many MiB are uploaded in resumable mode.
    #[arg(long, env = "SECURE_TRANSFER_RESUMABLE_MIB", default_value_t = 1024, global = true)]
    resumable_mib: u64,

    /// Offer to refresh a login session this many seconds before it expires.
    #[arg(long, env = "SECURE_TRANSFER_EXPIRY_WINDOW", default_value_t = 300, global = true)]
    expiry_window: u64,

    /// Log protocol details.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files (use `-` with --name to upload standard input).
    Upload {
        /// File patterns to upload (supports glob patterns like *.tar, file_{1,2,3}.txt).
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Resume a specific resumable upload.
        #[arg(long)]
        upload_id: Option<String>,

        /// File group that should own the import.
        #[arg(long)]
        group: Option<String>,

        /// Remote file name when uploading standard input.
        #[arg(long)]
        name: Option<String>,
    },

    /// Download an exported file.
    Download {
        /// Name of the file to download.
        filename: String,

        /// Local destination path (file or directory).
        #[arg(long, short = 't', default_value = ".")]
        to: PathBuf,

        /// Download id printed by an earlier, interrupted download.
        #[arg(long)]
        download_id: Option<String>,
    },

    /// List files available for download.
    DownloadList,

    /// List resumable uploads.
    ResumeList,

    /// Delete a resumable upload.
    ResumeDelete {
        /// Upload id to delete.
        upload_id: String,
    },

    /// Delete all resumable uploads.
    ResumeDeleteAll,

    /// Register this client for the selected environment. Asks for your
    /// credentials and obtains an API key, unless --api-key is given.
    Register {
        /// Use an API key you already have instead of requesting one.
        #[arg(long, env = "SECURE_TRANSFER_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },

    /// Show registered projects.
    ConfigShow,

    /// Delete the client registration.
    ConfigDelete,

    /// Delete all login sessions.
    SessionDelete,
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let config_dir = match &self.config_dir {
            Some(dir) => dir.clone(),
            None => Settings::default_config_dir()?,
        };
        let mut settings = Settings::new(self.environment, config_dir);
        settings.base_url = self.base_url.clone();
        settings.verbose = self.verbose;
        settings.policy = TransferPolicy {
            chunk_size: self.chunk_mib * MIB,
            resumable_threshold: self.resumable_mib * MIB,
            expiry_window: Duration::from_secs(self.expiry_window),
            ..TransferPolicy::default()
        };
        Ok(settings)
    }

    fn project(&self) -> Result<String> {
        let project = self
            .project
            .as_deref()
            .context("missing project: pass --project or set SECURE_TRANSFER_PROJECT")?;
        Ok(validate_project(project)?)
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "secure_transfer=debug"
    } else {
        "secure_transfer=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

impl Commands {
    /// Operation a command needs a token for; `None` for local commands.
    fn operation(&self) -> Option<Operation> {
        match self {
            Commands::Upload { .. } => Some(Operation::Upload),
            Commands::Download { .. } => Some(Operation::Download),
            Commands::DownloadList => Some(Operation::DownloadList),
            Commands::ResumeList => Some(Operation::ResumeList),
            Commands::ResumeDelete { .. } => Some(Operation::ResumeDelete),
            Commands::ResumeDeleteAll => Some(Operation::ResumeDeleteAll),
            Commands::Register { .. }
            | Commands::ConfigShow
            | Commands::ConfigDelete
            | Commands::SessionDelete => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings()?;
    init_tracing(settings.verbose);

    let Some(operation) = cli.command.operation() else {
        return run_local(&cli, &settings).await;
    };

    let project = cli.project()?;
    let auth = Authenticator::new(&settings, TerminalPrompt::new())?;
    let token = auth
        .authorize(&project, operation, cli.basic)
        .await
        .context("authentication failed")?;
    let client = FileApiClient::new(&settings.api_base(), token);

    let result = run_transfer(&cli.command, &settings, &client).await;
    if let Some(err) = result.as_ref().err().and_then(|e| e.downcast_ref::<TransferError>()) {
        if auth.forget_if_rejected(client.token(), err)? {
            eprintln!("The server rejected your login session. Run the command again to log in.");
        }
    }
    result
}

/// Commands that talk to the file API with an authorized client.
async fn run_transfer(command: &Commands, settings: &Settings, client: &FileApiClient) -> Result<()> {
    match command {
        Commands::Upload {
            patterns,
            upload_id,
            group,
            name,
        } => {
            if patterns.len() == 1 && patterns[0] == "-" {
                let name = name
                    .as_deref()
                    .context("uploading standard input needs --name")?;
                let outcome = client
                    .upload_stdin(name, group.as_deref(), &settings.policy)
                    .await
                    .context("failed to upload standard input")?;
                if let UploadOutcome::Streamed { bytes, .. } = outcome {
                    println!("Uploaded standard input as {} ({})", name, format_size(bytes));
                }
                return Ok(());
            }

            let files_to_upload = expand_patterns(patterns)?;
            if upload_id.is_some() && files_to_upload.len() != 1 {
                anyhow::bail!("--upload-id resumes exactly one file, got {}", files_to_upload.len());
            }

            println!(
                "Uploading {} file(s) to {}...",
                files_to_upload.len(),
                client.project()
            );

            let mut failures = 0;
            for (idx, file_path) in files_to_upload.iter().enumerate() {
                let filename = file_path.file_name().unwrap_or_default().to_string_lossy();
                println!("[{}/{}] Uploading {}... ", idx + 1, files_to_upload.len(), filename);

                match client
                    .upload_file(file_path, upload_id.as_deref(), group.as_deref(), &settings.policy)
                    .await
                {
                    Ok(UploadOutcome::Streamed { bytes, .. }) => {
                        println!("OK ({})", format_size(bytes));
                    }
                    Ok(UploadOutcome::Resumable(session)) => {
                        println!(
                            "OK ({}, {} chunk(s), upload id {})",
                            format_size(session.total_size),
                            session.chunk_count(),
                            session.upload_id
                        );
                    }
                    Err(e) => {
                        println!("FAILED");
                        eprintln!("  Error: {}", e);
                        if e.is_retryable() {
                            eprintln!("  Re-run the same command with the upload id above to resume.");
                        }
                        if matches!(
                            e,
                            TransferError::Auth(_) | TransferError::SessionExpired(_) | TransferError::Config(_)
                        ) {
                            return Err(e).context("upload aborted");
                        }
                        failures += 1;
                    }
                }
            }

            if failures > 0 {
                anyhow::bail!("{} of {} upload(s) failed", failures, files_to_upload.len());
            }
            println!("Done.");
        }

        Commands::Download {
            filename,
            to,
            download_id,
        } => {
            // Ensure destination directory exists
            if to.is_dir() || to.to_string_lossy().ends_with('/') {
                std::fs::create_dir_all(to)
                    .with_context(|| format!("Failed to create directory: {:?}", to))?;
            } else if let Some(parent) = to.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory: {:?}", parent))?;
                }
            }

            println!("Downloading {}... ", filename);

            let outcome = ExportManager::new(client)
                .download(filename, to, download_id.as_deref())
                .await
                .with_context(|| format!("Failed to download file: {}", filename))?;

            if outcome.resumed_from > 0 {
                println!("OK (resumed at {})", format_size(outcome.resumed_from));
            } else {
                println!("OK ({})", format_size(outcome.bytes_written));
            }
            println!("Saved to: {:?}", outcome.path);
            if let Some(id) = outcome.content_id {
                println!("Download id: {}", id);
            }
        }

        Commands::DownloadList => {
            let files = ExportManager::new(client)
                .list()
                .await
                .context("Failed to list export directory")?;

            if files.is_empty() {
                println!("No files found.");
            } else {
                println!("{:>10} {:<25} {}", "SIZE", "MODIFIED", "NAME");
                println!("{}", "-".repeat(60));
                for file in files {
                    println!("{}", file);
                }
            }
        }

        Commands::ResumeList => {
            let group = client.default_group();
            let uploads = ResumableCoordinator::new(client, &group)
                .list()
                .await
                .context("Failed to list resumable uploads")?;

            if uploads.is_empty() {
                println!("No resumable uploads.");
            } else {
                println!("{:<38} {:<24} {}", "UPLOAD ID", "PROGRESS", "NAME");
                println!("{}", "-".repeat(80));
                for upload in uploads {
                    println!("{}", upload);
                }
            }
        }

        Commands::ResumeDelete { upload_id } => {
            let group = client.default_group();
            let upload = ResumableCoordinator::new(client, &group)
                .delete(upload_id)
                .await
                .with_context(|| format!("Failed to delete upload {}", upload_id))?;
            println!("Deleted upload {} ({})", upload.id, upload.filename);
        }

        Commands::ResumeDeleteAll => {
            let group = client.default_group();
            ResumableCoordinator::new(client, &group)
                .delete_all()
                .await
                .context("Failed to delete resumable uploads")?;
            println!("Deleted all resumable uploads.");
        }

        Commands::Register { .. }
        | Commands::ConfigShow
        | Commands::ConfigDelete
        | Commands::SessionDelete => unreachable!("local command dispatched as a transfer"),
    }

    Ok(())
}

/// Commands that only touch local state, plus registration.
async fn run_local(cli: &Cli, settings: &Settings) -> Result<()> {
    match &cli.command {
        Commands::Register { api_key } => {
            let auth = Authenticator::new(settings, TerminalPrompt::new())?;
            let (project, api_key) = match api_key {
                Some(key) => (cli.project()?, key.clone()),
                None => auth
                    .fetch_api_key()
                    .await
                    .context("failed to obtain an API key")?,
            };
            auth.save_api_key(&project, &api_key)?;
            println!(
                "Registered {} for API environment {} ({})",
                project,
                settings.environment,
                settings.api_base()
            );
        }

        Commands::ConfigShow => {
            let registry = Registry::load(&settings.registry_path())?;
            if registry.is_empty() {
                println!("Client not registered.");
            } else {
                for (environment, project, key) in registry.entries() {
                    println!("{}\t{}\t{}", environment, project, mask_key(key));
                }
            }
        }

        Commands::ConfigDelete => {
            Registry::delete(&settings.registry_path())?;
            println!("Deleted client registration.");
        }

        Commands::SessionDelete => {
            SessionStore::new(settings.session_path()).clear()?;
            println!("Deleted login sessions.");
        }

        _ => unreachable!("transfer command dispatched as local"),
    }

    Ok(())
}

/// Expand glob and brace patterns into a sorted, de-duplicated list of files.
fn expand_patterns(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut files_to_upload: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        // Handle brace expansion manually for patterns like file_{1,2,3}.txt
        for expanded_pattern in expand_braces(pattern) {
            let matches: Vec<PathBuf> = glob(&expanded_pattern)
                .with_context(|| format!("Invalid glob pattern: {}", expanded_pattern))?
                .filter_map(|r| r.ok())
                .filter(|p| p.is_file())
                .collect();

            if matches.is_empty() {
                // If no glob matches, treat as literal path
                let path = PathBuf::from(&expanded_pattern);
                if path.is_file() {
                    files_to_upload.push(path);
                } else {
                    eprintln!("Warning: No files matched pattern: {}", expanded_pattern);
                }
            } else {
                files_to_upload.extend(matches);
            }
        }
    }

    files_to_upload.sort();
    files_to_upload.dedup();

    if files_to_upload.is_empty() {
        return Err(TransferError::NoFilesMatched(patterns.join(" ")).into());
    }
    Ok(files_to_upload)
}

/// Expand brace patterns like file_{1,2,3}.txt into multiple patterns.
fn expand_braces(pattern: &str) -> Vec<String> {
    if let Some(start) = pattern.find('{') {
        if let Some(end) = pattern[start..].find('}') {
            let end = start + end;
            let prefix = &pattern[..start];
            let suffix = &pattern[end + 1..];
            let alternatives = &pattern[start + 1..end];

            return alternatives
                .split(',')
                .flat_map(|alt| {
                    let expanded = format!("{}{}{}", prefix, alt.trim(), suffix);
                    expand_braces(&expanded)
                })
                .collect();
        }
    }

    vec![pattern.to_string()]
}
