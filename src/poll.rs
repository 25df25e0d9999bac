//! HTTP carrier: polls the VTN for events on a jittered interval and
//! posts replies back. TLS identity and CA configuration belong to the
//! deployment, not to this layer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ven::Ven;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
const MINIMUM_POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLLING_JITTER: f64 = 0.1;
const OADR2_URI_PATH: &str = "OpenADR2/Simple";

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub vtn_base_uri: String,
    pub poll_interval: Duration,
}

impl PollConfig {
    /// The minimum poll interval is enforced here, at init.
    pub fn new(vtn_base_uri: impl Into<String>, poll_interval: Duration) -> Self {
        let poll_interval = if poll_interval < MINIMUM_POLL_INTERVAL {
            warn!(
                requested = poll_interval.as_secs(),
                minimum = MINIMUM_POLL_INTERVAL.as_secs(),
                "poll interval below minimum, clamping"
            );
            MINIMUM_POLL_INTERVAL
        } else {
            poll_interval
        };
        Self {
            vtn_base_uri: vtn_base_uri.into(),
            poll_interval,
        }
    }
}

pub struct PollClient {
    ven: Arc<Ven>,
    http: reqwest::Client,
    event_uri: String,
    interval: Duration,
}

impl PollClient {
    pub fn new(ven: Arc<Ven>, config: PollConfig) -> Result<Self> {
        let base = config.vtn_base_uri.trim_end_matches('/');
        let event_uri = format!("{base}/{OADR2_URI_PATH}/EiEvent");
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            ven,
            http,
            event_uri,
            interval: config.poll_interval,
        })
    }

    /// One poll cycle: request events, ingest the broadcast, deliver the
    /// reply when one is produced.
    async fn query_vtn(&self) -> Result<()> {
        let request = self.ven.handler().build_request_payload()?;
        debug!(uri = %self.event_uri, "requesting events from VTN");

        let response = self
            .http
            .post(&self.event_uri)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(request)
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            debug!("VTN returned no events");
            return Ok(());
        }

        if let Some(reply) = self.ven.handle_broadcast(&body).await? {
            let status = self
                .http
                .post(&self.event_uri)
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(reply)
                .send()
                .await?
                .status();
            debug!(status = %status, "event response delivered");
        }
        Ok(())
    }

    /// Spawn the poll loop. Failures are logged and the next cycle runs
    /// anyway; broadcasts missed over a broken link are recovered on the
    /// next successful poll.
    pub fn spawn(self: Arc<Self>) -> (mpsc::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            info!(uri = %self.event_uri, interval = self.interval.as_secs(), "poll loop started");
            loop {
                if let Err(err) = self.query_vtn().await {
                    warn!(error = %err, "VTN poll failed");
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("poll loop exiting");
                        break;
                    }
                    _ = tokio::time::sleep(jittered(self.interval)) => {}
                }
            }
        });

        (shutdown_tx, handle)
    }
}

/// Uniform ±10 % jitter keeps a fleet from polling in lockstep.
fn jittered(interval: Duration) -> Duration {
    let secs = interval.as_secs_f64();
    let span = secs * POLLING_JITTER;
    Duration::from_secs_f64(rand::thread_rng().gen_range(secs - span..secs + span))
}
