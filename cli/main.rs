use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use vaultfs::auth::{export_auth_file, import_auth_file, AUTH_CONFIG_FILENAME};
use vaultfs::commander::{BatchResult, FileCommander, ProgressEvent};
use vaultfs::config::Config;
use vaultfs::real_file::{LocalFile, RealFile};
use vaultfs::sequencer::{FileSequencer, NonceSequencer};
use vaultfs::serializer::JsonSequenceSerializer;
use vaultfs::{Drive, VirtualFile};

/// Environment variable holding the drive password
const ENV_PASSWORD: &str = "VAULTFS_PASSWORD";

/// vaultfs - Encrypted virtual filesystem with AES-256-CTR and chunked HMAC
#[derive(Parser)]
#[command(name = "vaultfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vaultfs.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new drive and write the configuration file
    Init {
        /// Drive directory path
        #[arg(short, long, default_value = "./vault")]
        drive_dir: String,

        /// Nonce sequence file path (keep it outside the drive)
        #[arg(short, long, default_value = "./vaultfs.seq")]
        sequencer: String,
    },

    /// Import host files or directories into the drive
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Virtual directory to import into
        #[arg(short, long, default_value = "/")]
        dir: String,
    },

    /// Export drive files or directories to the host
    Export {
        /// Virtual paths to export
        #[arg(required = true)]
        paths: Vec<String>,

        /// Host directory (defaults to the drive's export directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List a virtual directory
    List {
        /// Virtual directory path
        #[arg(default_value = "/")]
        path: String,

        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Remove a virtual file or directory
    Remove {
        /// Virtual path to remove
        path: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Print this device's authorization id for the drive
    AuthId,

    /// Grant part of this device's nonce range to another device
    AuthExport {
        /// Authorization id printed by `auth-id` on the other device
        target: String,

        /// Artifact path (defaults to the drive's export directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import an authorization artifact created on another device
    AuthImport {
        /// Artifact path
        file: PathBuf,
    },

    /// Permanently stop this device from writing to the drive
    Revoke {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Change the drive password
    Passwd,

    /// Show drive status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,vaultfs=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "vaultfs starting");

    match cli.command {
        Commands::Init {
            drive_dir,
            sequencer,
        } => cmd_init(&cli.config, &drive_dir, &sequencer).await,

        Commands::Import { inputs, dir } => cmd_import(&cli.config, inputs, dir).await,

        Commands::Export { paths, output } => cmd_export(&cli.config, paths, output).await,

        Commands::List { path, verbose } => cmd_list(&cli.config, &path, verbose).await,

        Commands::Remove { path, yes } => cmd_remove(&cli.config, &path, yes).await,

        Commands::AuthId => cmd_auth_id(&cli.config).await,

        Commands::AuthExport { target, output } => {
            cmd_auth_export(&cli.config, &target, output).await
        }

        Commands::AuthImport { file } => cmd_auth_import(&cli.config, &file).await,

        Commands::Revoke { yes } => cmd_revoke(&cli.config, yes).await,

        Commands::Passwd => cmd_passwd(&cli.config).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

/// Create a styled progress bar for batch operations
fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim_end_matches(['\r', '\n']).to_string())
}

fn confirm(message: &str) -> Result<bool> {
    Ok(prompt(&format!("{message} [y/N]: "))?
        .trim()
        .eq_ignore_ascii_case("y"))
}

/// Password from `VAULTFS_PASSWORD`, otherwise asked on stdin
fn read_password(message: &str) -> Result<String> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        return Ok(password);
    }
    let password = prompt(message)?;
    if password.is_empty() {
        anyhow::bail!("password cannot be empty");
    }
    Ok(password)
}

fn read_new_password() -> Result<String> {
    if let Ok(password) = std::env::var(ENV_PASSWORD) {
        return Ok(password);
    }
    let password = read_password("New password: ")?;
    if prompt("Repeat password: ")? != password {
        anyhow::bail!("passwords do not match");
    }
    Ok(password)
}

fn open_sequencer(cfg: &Config) -> Result<Arc<dyn NonceSequencer>> {
    let sequencer = FileSequencer::new(&cfg.sequencer_path, Box::new(JsonSequenceSerializer))
        .with_context(|| format!("opening sequence file '{}'", cfg.sequencer_path))?;
    Ok(Arc::new(sequencer))
}

fn open_drive(cfg: &Config) -> Result<Drive> {
    let root = LocalFile::new(&cfg.drive_dir);
    if !Drive::exists(&root) {
        anyhow::bail!(
            "No drive found at '{}'. Run 'vaultfs init' first.",
            cfg.drive_dir
        );
    }
    let password = read_password("Password: ")?;
    let spinner = create_spinner("Unlocking drive...");
    let drive = Drive::open(
        Box::new(root),
        &password,
        open_sequencer(cfg)?,
        cfg.drive_options(),
    );
    spinner.finish_and_clear();
    drive.with_context(|| format!("opening drive '{}'", cfg.drive_dir))
}

fn resolve<'d>(drive: &'d Drive, path: &str) -> Result<VirtualFile<'d>> {
    drive
        .resolve(path)?
        .with_context(|| format!("'{}' not found in drive", path))
}

/// Drains progress events into a progress bar until the sender is dropped
fn track_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>, pb: ProgressBar) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ProgressEvent::Started { name, bytes } => {
                    pb.inc_length(bytes);
                    pb.set_message(name);
                }
                ProgressEvent::Finished { bytes, .. } => pb.inc(bytes),
                ProgressEvent::Failed { name, error } => {
                    pb.println(format!("  failed: {name}: {error}"));
                }
                ProgressEvent::Cancelled => pb.println("  cancelled"),
            }
        }
        pb.finish_and_clear();
    })
}

/// Cancels `token` on Ctrl-C; the running file still completes
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current file...");
            token.cancel();
        }
    });
}

fn print_batch<T: std::fmt::Debug>(verb: &str, result: &BatchResult<T>) {
    println!("{} {} item(s)", verb, result.succeeded.len());
    if !result.failed.is_empty() {
        println!("Failed ({}):", result.failed.len());
        for (item, error) in &result.failed {
            println!("  {:?}: {}", item, error);
        }
    }
    if result.cancelled {
        println!("Batch was cancelled before all items were processed.");
    }
}

/// Create a drive and write the configuration file
async fn cmd_init(config_path: &str, drive_dir: &str, sequencer: &str) -> Result<()> {
    println!("Initializing vaultfs...");

    let cfg = Config::new(drive_dir, sequencer);
    cfg.validate()?;

    // Check if config already exists
    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    fs::create_dir_all(drive_dir)
        .await
        .with_context(|| format!("creating drive directory '{}'", drive_dir))?;

    let password = read_new_password()?;
    let spinner = create_spinner("Deriving keys...");
    let drive = Drive::create(
        Box::new(LocalFile::new(drive_dir)),
        &password,
        open_sequencer(&cfg)?,
        cfg.drive_options(),
    );
    spinner.finish_and_clear();
    let drive = drive.with_context(|| format!("creating drive in '{}'", drive_dir))?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:    {}", config_path);
    println!("Drive:     {}", drive_dir);
    println!("Sequencer: {}", sequencer);
    println!("Drive id:  {}", drive.drive_id());
    println!();
    println!("IMPORTANT: Keep the sequence file with this device and never copy it.");
    println!("Reusing it on a second device would reuse nonces.");
    drive.close();
    Ok(())
}

/// Import host files into the drive
async fn cmd_import(config_path: &str, inputs: Vec<PathBuf>, dir: String) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = Arc::new(open_drive(&cfg)?);
    let commander = FileCommander::new(drive, cfg.threads);

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let progress = track_progress(rx, create_progress_bar("Importing"));

    let result = commander.import_files(inputs, dir, tx, cancel).await?;
    progress.await?;
    print_batch("Imported", &result);
    Ok(())
}

/// Export drive files to the host
async fn cmd_export(config_path: &str, paths: Vec<String>, output: Option<PathBuf>) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = Arc::new(open_drive(&cfg)?);
    let target = match output {
        Some(path) => path,
        None => PathBuf::from(drive.export_dir()?.path()),
    };
    let commander = FileCommander::new(drive, cfg.threads);

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    let progress = track_progress(rx, create_progress_bar("Exporting"));

    let result = commander
        .export_files(paths, target.clone(), tx, cancel)
        .await?;
    progress.await?;
    print_batch("Exported", &result);
    println!("Output: {}", target.display());
    Ok(())
}

/// List a virtual directory
async fn cmd_list(config_path: &str, path: &str, verbose: bool) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;
    let dir = resolve(&drive, path)?;
    if !dir.is_directory() {
        anyhow::bail!("'{}' is not a directory", path);
    }

    let files = dir.list_files()?;
    if files.is_empty() {
        println!("No files found");
        return Ok(());
    }

    println!("{} ({} entries):", path, files.len());
    println!();

    if verbose {
        println!("{:<40} {:>12} {:>10} {:>10}", "NAME", "SIZE (bytes)", "CHUNK", "NONCE");
        println!("{}", "-".repeat(76));
    }
    for file in files {
        let name = file
            .name()
            .unwrap_or_else(|_| format!("<undecryptable: {}>", file.real_file().name()));
        if file.is_directory() {
            println!("  {}/", name);
            continue;
        }
        let size = file.length()?;
        if verbose {
            let (chunk, nonce) = match file.header()? {
                Some(h) => (h.chunk_size().to_string(), h.nonce().to_string()),
                None => ("-".to_string(), "-".to_string()),
            };
            println!("{:<40} {:>12} {:>10} {:>10}", name, size, chunk, nonce);
        } else {
            println!("  {} ({} bytes)", name, size);
        }
    }
    Ok(())
}

/// Remove a virtual file or directory
async fn cmd_remove(config_path: &str, path: &str, yes: bool) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;
    let file = resolve(&drive, path)?;

    // Confirm deletion unless --yes flag is set
    if !yes && !confirm(&format!("Delete '{}'? This cannot be undone.", path))? {
        println!("Cancelled.");
        return Ok(());
    }

    file.delete()?;
    println!("Deleted '{}'", path);
    Ok(())
}

/// Print this device's authorization id
async fn cmd_auth_id(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;
    println!("Drive id: {}", drive.drive_id());
    println!("Auth id:  {}", drive.auth_id()?);
    Ok(())
}

/// Write an authorization artifact for another device
async fn cmd_auth_export(config_path: &str, target: &str, output: Option<PathBuf>) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;
    let file: Box<dyn RealFile> = match output {
        Some(path) => Box::new(LocalFile::new(path)),
        None => drive.export_dir()?.child(AUTH_CONFIG_FILENAME),
    };
    if file.exists() {
        anyhow::bail!("'{}' already exists", file.path());
    }

    let config = export_auth_file(&drive, target, file.as_ref())?;
    println!("Authorization written to {}", file.path());
    println!(
        "Nonce range granted: {} to {}",
        config.start_nonce, config.max_nonce
    );
    Ok(())
}

/// Import an authorization artifact
async fn cmd_auth_import(config_path: &str, file: &PathBuf) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;
    let config = import_auth_file(&drive, &LocalFile::new(file))
        .with_context(|| format!("importing authorization {:?}", file))?;
    println!("This device is now authorized for drive {}", drive.drive_id());
    println!(
        "Nonce range: {} to {}",
        config.start_nonce, config.max_nonce
    );
    Ok(())
}

/// Revoke this device's sequence
async fn cmd_revoke(config_path: &str, yes: bool) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;

    if !yes
        && !confirm("Revoke this device? It will never be able to write to the drive again.")?
    {
        println!("Cancelled.");
        return Ok(());
    }

    drive.revoke_authorization()?;
    println!("Device revoked for drive {}", drive.drive_id());
    Ok(())
}

/// Change the drive password
async fn cmd_passwd(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let mut drive = open_drive(&cfg)?;
    // the current password may have come from the environment
    let password = {
        let password = prompt("New password: ")?;
        if password.is_empty() {
            anyhow::bail!("password cannot be empty");
        }
        if prompt("Repeat password: ")? != password {
            anyhow::bail!("passwords do not match");
        }
        password
    };
    let spinner = create_spinner("Re-wrapping keys...");
    let result = drive.change_password(&password);
    spinner.finish_and_clear();
    result?;
    println!("Password changed.");
    Ok(())
}

/// Totals of a virtual tree: (files, directories, bytes)
fn tree_stats(dir: &VirtualFile<'_>) -> Result<(u64, u64, u64)> {
    let mut stats = (0, 0, 0);
    for entry in dir.list_files()? {
        if entry.is_directory() {
            let (files, dirs, bytes) = tree_stats(&entry)?;
            stats.0 += files;
            stats.1 += dirs + 1;
            stats.2 += bytes;
        } else {
            stats.0 += 1;
            stats.2 += entry.length()?;
        }
    }
    Ok(stats)
}

/// Show drive status and statistics
async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = Config::load_with_env(Some(config_path))?;
    let drive = open_drive(&cfg)?;

    println!("vaultfs Status");
    println!();

    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Drive dir:     {}", cfg.drive_dir);
    println!("  Sequencer:     {}", cfg.sequencer_path);
    println!("  Threads:       {}", cfg.threads);
    println!("  Provider:      {:?}", cfg.provider);
    println!("  Integrity:     {}", if cfg.integrity { "on" } else { "off" });
    println!("  Chunk size:    {}", cfg.chunk_size);
    println!();

    println!("Drive:");
    println!("  Drive id:      {}", drive.drive_id());
    match drive.sequencer().get_sequence(&drive.drive_id())? {
        Some(sequence) => {
            println!("  Auth id:       {}", sequence.auth_id);
            println!("  Sequence:      {:?}", sequence.status);
            if let (Some(next), Some(max)) = (sequence.next_nonce, sequence.max_nonce) {
                println!("  Next nonce:    {}", next);
                println!("  Max nonce:     {}", max);
                println!(
                    "  Remaining:     {}",
                    max.to_u64().saturating_sub(next.to_u64())
                );
            }
        }
        None => println!("  Sequence:      none (device revoked or not registered)"),
    }
    println!();

    let (files, dirs, bytes) = tree_stats(&drive.root())?;
    println!("Storage Statistics:");
    println!("  Total files:       {}", files);
    println!("  Directories:       {}", dirs);
    println!(
        "  Total size:        {} bytes ({:.2} MB)",
        bytes,
        bytes as f64 / 1_048_576.0
    );
    Ok(())
}
