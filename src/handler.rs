//! Broadcast ingest: the per-event acceptance pipeline, implicit
//! cancellation, the operator opt-out set, and reply assembly.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::VenConfig;
use crate::event::{Event, EventStatus};
use crate::oadr::{self, NsMap, OptType, ReplyEntry, ResponseRequired};
use crate::store::EventStore;

pub struct EventHandler {
    config: VenConfig,
    ns: NsMap,
    store: Arc<dyn EventStore>,
    optouts: RwLock<HashSet<String>>,
    /// Serializes the composite store sequences of ingest and the control
    /// tick; shared with the controller via the supervisor.
    gate: Arc<Mutex<()>>,
}

impl EventHandler {
    pub fn new(config: VenConfig, store: Arc<dyn EventStore>, gate: Arc<Mutex<()>>) -> Self {
        let ns = NsMap::for_profile(config.profile);
        Self {
            config,
            ns,
            store,
            optouts: RwLock::new(HashSet::new()),
            gate,
        }
    }

    pub fn ven_id(&self) -> &str {
        &self.config.ven_id
    }

    /// Ingest one `oadrDistributeEvent` document and produce the reply
    /// payload when any event required a response.
    pub async fn handle_broadcast(&self, xml: &str) -> Result<Option<String>> {
        let broadcast = oadr::parse_distribute_event(xml, &self.ns)?;

        if !self.config.vtn_ids.is_empty() {
            let known = broadcast
                .vtn_id
                .as_deref()
                .is_some_and(|id| self.config.vtn_ids.iter().any(|v| v == id));
            if !known {
                let vtn_id = broadcast.vtn_id.as_deref().unwrap_or("<none>");
                warn!(vtn_id = %vtn_id, "rejecting broadcast from unknown VTN");
                return Ok(Some(oadr::build_error_response(
                    &self.config.ven_id,
                    &broadcast.request_id,
                    400,
                    &format!("Unknown vtnID: {vtn_id}"),
                    &self.ns,
                )?));
            }
        }

        let _guard = self.gate.lock().await;
        let now = Utc::now();
        let mut reply_entries = Vec::new();
        let mut seen: HashSet<String> = broadcast.skipped.iter().cloned().collect();

        for envelope in broadcast.events {
            let event = envelope.event;
            seen.insert(event.id.clone());

            let prior = match self.store.get(&event.id).await {
                Ok(prior) => prior,
                Err(err) => {
                    error!(event_id = %event.id, error = %err, "store lookup failed");
                    continue;
                }
            };

            let (opt, code) = self.accept(&event, prior.as_ref()).await;

            if envelope.response_required == ResponseRequired::Always {
                reply_entries.push(ReplyEntry {
                    event_id: event.id.clone(),
                    mod_number: event.mod_number,
                    request_id: broadcast.request_id.clone(),
                    opt,
                    response_code: code,
                });
            }

            if opt == OptType::OptIn {
                let event_id = event.id.clone();
                if let Err(err) = self.persist(event, prior, now).await {
                    error!(event_id = %event_id, error = %err, "failed to persist event");
                }
            }
        }

        self.cancel_omitted(&seen, now).await;

        if reply_entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(oadr::build_created_event(
                &self.config.ven_id,
                &reply_entries,
                &self.ns,
            )?))
        }
    }

    /// The acceptance decision for one event. Checks run in protocol
    /// order and each failing check overwrites the outcome, so the last
    /// failure wins the reported code.
    async fn accept(&self, event: &Event, prior: Option<&Event>) -> (OptType, u16) {
        let mut opt = OptType::OptIn;
        let mut code = 200;

        if let Some(prior) = prior {
            if event.mod_number < prior.mod_number {
                warn!(
                    event_id = %event.id,
                    received = event.mod_number,
                    stored = prior.mod_number,
                    "modification number went backwards"
                );
                (opt, code) = (OptType::OptOut, 403);
            }
        }

        if !self.matches_target(event) {
            info!(event_id = %event.id, "opting out: no target match");
            (opt, code) = (OptType::OptOut, 403);
        }

        if self.optouts.read().await.contains(&event.id) {
            info!(event_id = %event.id, "opting out: operator opt-out");
            (opt, code) = (OptType::OptOut, 200);
        }

        if event.signals.is_empty() {
            info!(event_id = %event.id, "opting out: no simple signal");
            (opt, code) = (OptType::OptOut, 403);
        }

        if !self.config.market_contexts.is_empty() {
            let matched = event
                .market_context
                .as_deref()
                .is_some_and(|ctx| self.config.market_contexts.iter().any(|m| m == ctx));
            if !matched {
                info!(
                    event_id = %event.id,
                    market_context = event.market_context.as_deref().unwrap_or("<none>"),
                    "opting out: market context does not match"
                );
                (opt, code) = (OptType::OptOut, 405);
            }
        }

        (opt, code)
    }

    /// Empty target sets address everyone; otherwise at least one of our
    /// identifiers must be a member of its corresponding set.
    fn matches_target(&self, event: &Event) -> bool {
        let targets = &event.targets;
        if targets.is_empty() {
            return true;
        }
        let member = |ids: &[String], ours: Option<&str>| {
            ours.is_some_and(|ours| ids.iter().any(|id| id == ours))
        };
        member(&targets.ven_ids, Some(&self.config.ven_id))
            || member(&targets.group_ids, self.config.group_id.as_deref())
            || member(&targets.resource_ids, self.config.resource_id.as_deref())
            || member(&targets.party_ids, self.config.party_id.as_deref())
    }

    async fn persist(
        &self,
        mut event: Event,
        prior: Option<Event>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match prior {
            None => {
                if event.status == EventStatus::Cancelled {
                    // never active on our side, so no tail randomization
                    event.cancel_from(EventStatus::Pending, now);
                }
                self.store.add(&event).await
            }
            Some(prior) if event.mod_number > prior.mod_number => {
                if event.start_offset_bound == prior.start_offset_bound {
                    // keep the offset drawn at first observation
                    event.start = event.original_start + (prior.start - prior.original_start);
                    event.end = event.nominal_end();
                }
                if event.status == EventStatus::Cancelled {
                    if prior.status == EventStatus::Cancelled {
                        // VTN re-sent a cancellation; keep the randomized tail
                        event.end = prior.end;
                    } else {
                        event.cancel_from(prior.status, now);
                    }
                }
                self.store.update(&event).await
            }
            Some(_) => {
                debug!(event_id = %event.id, "unchanged modification number, store untouched");
                Ok(())
            }
        }
    }

    /// A stored event omitted from the latest broadcast is implicitly
    /// cancelled. Events already in a terminal state are left alone.
    async fn cancel_omitted(&self, seen: &HashSet<String>, now: DateTime<Utc>) {
        let stored = match self.store.active().await {
            Ok(stored) => stored,
            Err(err) => {
                error!(error = %err, "failed to scan store for implicit cancellations");
                return;
            }
        };
        for mut event in stored {
            if seen.contains(&event.id) || event.status.is_terminal() {
                continue;
            }
            debug!(event_id = %event.id, "event omitted from broadcast, marking cancelled");
            event.cancel(now);
            if let Err(err) = self.store.update(&event).await {
                error!(event_id = %event.id, error = %err, "failed to persist implicit cancellation");
            }
        }
    }

    /// The stored active set, sorted by effective start. Opted-out events
    /// are included; the selection skips them via [`optout_snapshot`].
    ///
    /// [`optout_snapshot`]: EventHandler::optout_snapshot
    pub async fn active_events(&self) -> Result<Vec<Event>> {
        self.store.active().await
    }

    /// Current operator opt-outs, for the selection pass.
    pub async fn optout_snapshot(&self) -> HashSet<String> {
        self.optouts.read().await.clone()
    }

    /// Remove events from the store, forgetting any opt-out for them.
    pub async fn remove_events(&self, event_ids: &[String]) -> Result<()> {
        self.store.remove(event_ids).await?;
        let mut optouts = self.optouts.write().await;
        for id in event_ids {
            optouts.remove(id);
        }
        Ok(())
    }

    /// Operator opt-out. Only stored events can be opted out of; returns
    /// whether the opt-out was recorded.
    pub async fn optout_event(&self, event_id: &str) -> Result<bool> {
        if self.store.get(event_id).await?.is_none() {
            return Ok(false);
        }
        self.optouts.write().await.insert(event_id.to_string());
        Ok(true)
    }

    /// The `oadrRequestEvent` payload the poll carrier posts to the VTN.
    pub fn build_request_payload(&self) -> Result<String> {
        Ok(oadr::build_request_event(&self.config.ven_id, &self.ns)?)
    }
}
