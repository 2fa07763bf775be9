//! Operator CLI for a blobtree store.
//!
//! Examples:
//! ```bash
//! blobtree --root /srv/files ls docs
//! blobtree --root /srv/files upload ./report.pdf docs/2024
//! blobtree get docs/2024/report.pdf -o report.pdf        # backend from the environment
//! blobtree mkdir docs/archive
//! blobtree mv docs/2024 docs/archive/2024
//! blobtree cp docs/readme.md docs/readme.bak.md
//! blobtree rm docs/archive                               # recursive for directories
//! blobtree stat docs/readme.md
//! ```

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blobtree::progress::ProgressBarSink;
use blobtree::{BackendConfig, Entry, FileService, StorageConfig, UploadRequest};

/// Print to stdout, exiting quietly when the reader went away (e.g. piped into `head`).
macro_rules! safe_println {
    ($($arg:tt)*) => {
        match writeln!(io::stdout(), $($arg)*) {
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                std::process::exit(0);
            }
            Err(e) => return Err(e.into())
        }
    };
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(
        short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity: -v = Info, -vv = Debug",
    )]
    verbose: u8,

    /// Use the filesystem backend rooted here instead of the environment configuration.
    #[arg(long, value_name = "DIR", global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the direct children of a directory.
    Ls {
        #[arg(default_value = "")]
        path: String,
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Upload a local file into a directory.
    Upload {
        file: PathBuf,
        #[arg(default_value = "")]
        directory: String,
        /// Override the content type inferred from the extension.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Download a file to a local path or stdout.
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete a file, or a directory with everything below it.
    Rm { path: String },
    /// Create an empty directory.
    Mkdir { path: String },
    /// Rename (move) a file or directory.
    Mv { from: String, to: String },
    /// Copy a file or directory.
    Cp { from: String, to: String },
    /// Show one file or directory.
    Stat { path: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();
    // Capture `log` records from dependencies.
    tracing_log::LogTracer::init().ok();

    let config = match &cli.root {
        Some(root) => StorageConfig::new(BackendConfig::File { root: root.clone() }),
        None => StorageConfig::from_env().context("no backend configured; pass --root or set BLOBTREE_BACKEND")?,
    };
    let service = FileService::from_config(config).await?;

    match cli.cmd {
        Command::Ls { path, json } => ls_cmd(&service, &path, json).await?,
        Command::Upload {
            file,
            directory,
            content_type,
        } => upload_cmd(&service, &file, &directory, content_type).await?,
        Command::Get { path, output } => get_cmd(&service, &path, output).await?,
        Command::Rm { path } => {
            let outcome = service.delete_item(&path).await?;
            safe_println!(
                "deleted {} {} ({} key(s))",
                if outcome.is_directory { "directory" } else { "file" },
                outcome.deleted_path,
                outcome.keys_deleted
            );
        }
        Command::Mkdir { path } => {
            let listing = service.create_folder(&path).await?;
            for entry in &listing.data {
                safe_println!("created {}/", entry.path());
            }
        }
        Command::Mv { from, to } => {
            let report = service.rename(&from, &to).await?;
            safe_println!("{} -> {} ({} key(s))", report.source, report.destination, report.keys);
        }
        Command::Cp { from, to } => {
            let report = service.copy(&from, &to).await?;
            safe_println!("{} -> {} ({} key(s))", report.source, report.destination, report.keys);
        }
        Command::Stat { path } => stat_cmd(&service, &path).await?,
    }
    Ok(())
}

async fn ls_cmd(service: &FileService, path: &str, json: bool) -> Result<()> {
    let listing = service.list(path).await?;
    if json {
        safe_println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    for entry in &listing.data {
        match entry {
            Entry::Directory(dir) => safe_println!("{:>12}  {}/", "-", dir.name),
            Entry::File(file) => safe_println!("{:>12}  {}", file.size, file.name),
        }
    }
    safe_println!("\nTotal entries: {}", listing.data.len());
    Ok(())
}

async fn upload_cmd(
    service: &FileService,
    file: &Path,
    directory: &str,
    content_type: Option<String>,
) -> Result<()> {
    let name = file
        .file_name()
        .context("upload source has no file name")?
        .to_string_lossy()
        .to_string();
    let source = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("cannot open {}", file.display()))?;
    let size = source.metadata().await?.len();

    let mut request = UploadRequest::new(directory, name.clone(), size);
    if let Some(ct) = content_type {
        request = request.content_type(ct);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling upload");
            on_interrupt.cancel();
        }
    });

    let bar = ProgressBarSink::new(&name, size);
    let started = Instant::now();
    match service.upload(request, source, &bar, &cancel).await {
        Ok(entry) => {
            bar.finish("upload", size, started.elapsed());
            info!("uploaded {} ({} bytes)", entry.path, entry.size);
            safe_println!("{}", entry.path);
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            Err(e.into())
        }
    }
}

async fn get_cmd(service: &FileService, path: &str, output: Option<PathBuf>) -> Result<()> {
    let download = service.download(path).await?;
    match output {
        Some(out) => {
            tokio::fs::write(&out, &download.body)
                .await
                .with_context(|| format!("cannot write {}", out.display()))?;
            info!("wrote {} bytes to {}", download.content_length, out.display());
        }
        None => {
            let mut stdout = io::stdout().lock();
            match stdout.write_all(&download.body) {
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                other => other?,
            }
        }
    }
    Ok(())
}

async fn stat_cmd(service: &FileService, path: &str) -> Result<()> {
    match service.stat(path).await? {
        Entry::Directory(dir) => {
            safe_println!("Path            : {}/", dir.path);
            safe_println!("Type            : directory");
        }
        Entry::File(file) => {
            safe_println!("Path            : {}", file.path);
            safe_println!("Type            : file");
            safe_println!("Size            : {}", file.size);
            if let Some(ref lm) = file.last_modified {
                safe_println!("LastModified    : {}", lm);
            }
            if let Some(ref ct) = file.content_type {
                safe_println!("Content-Type    : {}", ct);
            }
        }
    }
    Ok(())
}
