#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use courier::{Admission, Courier, config::find_config_file};
use courier_common::{DeliveryRequest, SystemClock, logging};

/// Tenant-scoped email delivery worker
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Queue and deliver email through tenant credentials", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the delivery worker and HTTP ingress until interrupted
    Serve,
    /// Queue one email on the main lane
    Enqueue {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,

        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        /// Message body (HTML)
        #[arg(long)]
        body: String,

        /// Event id, generated when omitted
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config)?;
    let courier = Courier::from_file(&config_path)?;

    match cli.command {
        Commands::Serve => courier.run().await,
        Commands::Enqueue {
            tenant,
            user,
            to,
            subject,
            body,
            id,
        } => {
            logging::init();
            let pipeline = courier.build(Arc::new(SystemClock)).await?;

            let request = DeliveryRequest {
                id,
                tenant_id: tenant,
                user_id: user,
                to_address: to,
                subject,
                body,
                ..Default::default()
            };

            let admission = pipeline.enqueue(request).await;
            pipeline.broker().shutdown().await;

            match admission? {
                Admission::Queued(event) => {
                    println!("{}", event.id);
                    Ok(())
                }
                Admission::RateLimited => anyhow::bail!("Rate limit exceeded, try again later"),
            }
        }
    }
}
