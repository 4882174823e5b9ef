/*!
 * Pulsar CLI
 *
 * `pulsar serve` runs a Star; `submit`, `status` and `cancel` talk to one.
 */

use clap::{Parser, Subcommand};
use pulsar::{
    commands::{
        client::{self, Target},
        serve,
    },
    config::{PulsarConfig, DEFAULT_CONFIG_FILE},
    error::{PulsarError, Result, EXIT_REJECTED, EXIT_SUCCESS},
    logging,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "pulsar")]
#[command(version, about = "Copy directory trees across a fleet of servers", long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a copy job; prints the job id
    Submit {
        /// Source directory, as seen by the Stars
        src: PathBuf,

        /// Destination directory, as seen by the Stars
        dst: PathBuf,

        /// Submitting user
        #[arg(short, long, env = "USER", default_value = "anonymous")]
        user: String,

        /// Star to submit to (default: first configured server)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Show a job's progress
    Status {
        job_id: u64,

        /// Star that owns the job (default: first configured server)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Cancel a running job
    Cancel {
        job_id: u64,

        /// Star that owns the job (default: first configured server)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Run a Star until interrupted
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,

        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,

        /// Log copies instead of performing them
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => EXIT_SUCCESS,
        Err(PulsarError::Rejected(reply)) => {
            // Error replies already carry their "Error:" prefix
            println!("{}", reply);
            EXIT_REJECTED
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PulsarConfig::from_file(&cli.config)?;

    if let Commands::Serve {
        bind,
        port,
        dry_run,
    } = &cli.command
    {
        if let Some(bind) = bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
        config.server.dry_run |= *dry_run;
    }

    logging::init_logging(&config.logging, cli.debug)?;

    let target = |server: Option<String>| -> Result<Target> {
        let server = match server {
            Some(server) => server,
            None => config
                .primary_server()
                .map(str::to_string)
                .ok_or_else(|| PulsarError::Config("no server configured".to_string()))?,
        };
        Ok(Target {
            server,
            connect_timeout: config.dispatch.connect_timeout(),
        })
    };

    match cli.command {
        Commands::Submit {
            src,
            dst,
            user,
            server,
        } => {
            let reply = client::submit(&target(server)?, &user, &src, &dst).await?;
            println!("{}", reply);
        }
        Commands::Status { job_id, server } => {
            println!("{}", client::status(&target(server)?, job_id).await?);
        }
        Commands::Cancel { job_id, server } => {
            println!("{}", client::cancel(&target(server)?, job_id).await?);
        }
        Commands::Serve { .. } => {
            serve::run_star(&config, CancellationToken::new()).await?;
        }
    }

    Ok(())
}
