use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oadr2_ven::{OadrProfile, PollClient, PollConfig, SqliteStore, Ven, VenConfig};

#[derive(Parser)]
#[command(name = "oadr2-ven")]
#[command(about = "OpenADR 2.0a Virtual End Node daemon")]
struct Args {
    /// This VEN's identifier
    #[arg(long)]
    ven_id: String,

    /// Accepted VTN ids, comma separated (empty accepts any)
    #[arg(long, value_delimiter = ',')]
    vtn_ids: Vec<String>,

    /// Accepted market contexts, comma separated (empty accepts any)
    #[arg(long, value_delimiter = ',')]
    market_contexts: Vec<String>,

    /// Group membership used for target matching
    #[arg(long)]
    group_id: Option<String>,

    /// Resource identifier used for target matching
    #[arg(long)]
    resource_id: Option<String>,

    /// Party identifier used for target matching
    #[arg(long)]
    party_id: Option<String>,

    /// OpenADR profile, selects the XML namespace map
    #[arg(long, value_enum, default_value = "2.0a")]
    profile: OadrProfile,

    /// Data directory for the SQLite event database
    #[arg(short, long, default_value = "/var/lib/oadr2-ven")]
    data_dir: PathBuf,

    /// Control loop interval in seconds
    #[arg(long, default_value_t = 30)]
    control_interval: u64,

    /// Base URI of the VTN; polling is disabled when omitted
    #[arg(long)]
    vtn_base_uri: Option<String>,

    /// VTN poll interval in seconds (minimum 10)
    #[arg(long, default_value_t = 300)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oadr2_ven=info".parse()?))
        .init();

    let args = Args::parse();

    tokio::fs::create_dir_all(&args.data_dir).await?;
    info!(data_dir = %args.data_dir.display(), ven_id = %args.ven_id, "initializing oadr2-ven");

    let store = Arc::new(SqliteStore::new(&args.data_dir.join("events.db")).await?);

    let config = VenConfig {
        ven_id: args.ven_id,
        vtn_ids: args.vtn_ids,
        market_contexts: args.market_contexts,
        group_id: args.group_id,
        resource_id: args.resource_id,
        party_id: args.party_id,
        profile: args.profile,
        control_interval: Duration::from_secs(args.control_interval),
    };

    let ven = Arc::new(Ven::new(
        config,
        store,
        Box::new(|old, new| {
            info!(old, new, "signal level changed");
            Ok(())
        }),
    ));
    ven.start().await;

    let poller = match args.vtn_base_uri {
        Some(base_uri) => {
            let config = PollConfig::new(base_uri, Duration::from_secs(args.poll_interval));
            let client = Arc::new(PollClient::new(ven.clone(), config)?);
            Some(client.spawn())
        }
        None => {
            info!("no VTN base URI configured, polling disabled");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some((shutdown_tx, handle)) = poller {
        let _ = shutdown_tx.send(()).await;
        let _ = handle.await;
    }
    ven.stop().await;

    Ok(())
}
