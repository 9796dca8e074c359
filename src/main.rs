use anyhow::Result;
use clap::{Parser, Subcommand};
use fusewire::modules::pipe::{max_pipe_size, page_size, splice_supported};
use fusewire::{MountOptions, PipePool, Session};
use log::{info, LevelFilter};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a mount point and hold it until SIGINT or SIGTERM
    Mount {
        /// Mount point (or /dev/fd/N for an already mounted descriptor)
        mount_point: PathBuf,
        /// Comma-separated mount options
        #[arg(short = 'o', value_delimiter = ',')]
        options: Vec<String>,
        /// Try mount(2) before the fusermount helper
        #[arg(long)]
        direct: bool,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
        /// Filesystem subtype
        #[arg(long)]
        name: Option<String>,
        /// JSON file with mount options
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Unmount a mount point
    Unmount {
        /// Mount point
        mount_point: PathBuf,
        /// Try umount(2) before the fusermount helper
        #[arg(long)]
        direct: bool,
    },
    /// Print the splice capabilities of this system as JSON
    Probe,
}

#[derive(Serialize)]
struct Capabilities {
    splice: bool,
    page_size: usize,
    max_pipe_size: usize,
}

fn mount_options(
    options: Vec<String>,
    direct: bool,
    allow_other: bool,
    name: Option<String>,
    config: Option<PathBuf>,
    verbose: bool,
) -> Result<MountOptions> {
    let mut opts = match config {
        Some(path) => MountOptions::from_json_file(&path)?,
        None => MountOptions::default(),
    };
    opts.options.extend(options);
    opts.direct_mount |= direct;
    opts.allow_other |= allow_other;
    opts.debug |= verbose;
    if let Some(name) = name {
        opts.name = name;
    }
    Ok(opts)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    match cli.command {
        Commands::Mount {
            mount_point,
            options,
            direct,
            allow_other,
            name,
            config,
        } => {
            let opts = mount_options(options, direct, allow_other, name, config, cli.verbose)?;
            let session = tokio::task::spawn_blocking(move || {
                Session::mount(&mount_point, opts, Arc::new(PipePool::new()))
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&session.info())?);

            tokio::task::spawn_blocking(move || -> Result<()> {
                session.wait_for_signal()?;
                info!("Unmounting...");
                session.unmount()
            })
            .await??;
        }
        Commands::Unmount {
            mount_point,
            direct,
        } => {
            let opts = MountOptions {
                direct_mount: direct,
                debug: cli.verbose,
                ..Default::default()
            };
            fusewire::unmount(&mount_point, &opts)?;
            println!("Unmounted {}", mount_point.display());
        }
        Commands::Probe => {
            let caps = Capabilities {
                splice: splice_supported(),
                page_size: page_size(),
                max_pipe_size: max_pipe_size(),
            };
            println!("{}", serde_json::to_string_pretty(&caps)?);
        }
    }

    Ok(())
}
