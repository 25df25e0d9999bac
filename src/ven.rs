//! Lifecycle supervisor tying handler, store and control loop together.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::VenConfig;
use crate::controller::{EventController, SignalCallback};
use crate::handler::EventHandler;
use crate::store::EventStore;

const STOP_JOIN_WINDOW: Duration = Duration::from_secs(2);

pub struct Ven {
    handler: Arc<EventHandler>,
    controller: Arc<EventController>,
    running: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl Ven {
    pub fn new(config: VenConfig, store: Arc<dyn EventStore>, callback: SignalCallback) -> Self {
        let gate = Arc::new(Mutex::new(()));
        let handler = Arc::new(EventHandler::new(config.clone(), store, gate.clone()));
        let controller = Arc::new(EventController::new(
            handler.clone(),
            gate,
            config.control_interval,
            callback,
        ));
        Self {
            handler,
            controller,
            running: Mutex::new(None),
        }
    }

    pub fn handler(&self) -> &Arc<EventHandler> {
        &self.handler
    }

    pub fn controller(&self) -> &Arc<EventController> {
        &self.controller
    }

    /// Start the control loop. Idempotent.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("control loop already running");
            return;
        }
        info!("starting control loop");
        *running = Some(self.controller.clone().spawn());
    }

    /// Wake the control loop ahead of its next tick.
    pub fn nudge(&self) {
        self.controller.events_updated();
    }

    /// Ingest a broadcast and wake the control loop so level changes
    /// propagate immediately.
    pub async fn handle_broadcast(&self, xml: &str) -> Result<Option<String>> {
        let reply = self.handler.handle_broadcast(xml).await?;
        self.nudge();
        Ok(reply)
    }

    /// Signal the loop to exit and join it within a bounded window.
    /// Idempotent; an in-flight tick is allowed to finish.
    pub async fn stop(&self) {
        let Some((shutdown_tx, handle)) = self.running.lock().await.take() else {
            return;
        };
        let _ = shutdown_tx.send(()).await;
        if tokio::time::timeout(STOP_JOIN_WINDOW, handle).await.is_err() {
            warn!("control loop did not stop in time, detaching");
        } else {
            info!("control loop stopped");
        }
    }

    /// Current signal level computed on demand against the live active
    /// set; `(0.0, None)` when no event is driving.
    pub async fn current_signal_level(&self) -> Result<(f64, Option<String>)> {
        self.controller.current_signal_level().await
    }
}
