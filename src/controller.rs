//! Control loop: periodically scans the active events, selects the
//! signal level downstream equipment must follow, fires the change
//! callback and purges expired events.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event::{Event, EventStatus};
use crate::handler::EventHandler;

/// Invoked with `(old_level, new_level)` whenever the selected level
/// changes. A failure is logged; the cached level advances regardless.
pub type SignalCallback = Box<dyn Fn(f64, f64) -> Result<()> + Send + Sync>;

/// Outcome of one selection pass.
#[derive(Debug, Default, PartialEq)]
pub struct Selection {
    pub level: f64,
    pub event_id: Option<String>,
    pub expired: Vec<String>,
}

/// Compute the current signal level over the active set. Deterministic
/// given `(events, optouts, now)`; `events` is expected in start-ascending
/// order, which makes the priority tie-break "first activated wins".
/// Opted-out events behave like test events: tracked and expirable, but
/// never driving the level.
pub fn select_signal(
    events: &[Event],
    optouts: &std::collections::HashSet<String>,
    now: DateTime<Utc>,
) -> Selection {
    let mut selection = Selection::default();
    let mut leading: Option<&Event> = None;

    for event in events {
        if event.status == EventStatus::Cancelled {
            if let Some(end) = event.end {
                if now > end {
                    debug!(event_id = %event.id, "cancelled event has lapsed");
                    selection.expired.push(event.id.clone());
                    continue;
                }
            }
        }

        if event.signals.is_empty() {
            debug!(event_id = %event.id, "ignoring event without signals");
            continue;
        }

        let interval = match event.current_interval(now) {
            Some(interval) => interval,
            None => {
                match event.end {
                    Some(end) if end < now => {
                        debug!(event_id = %event.id, mod_number = event.mod_number, "event has ended");
                        selection.expired.push(event.id.clone());
                    }
                    _ if event.start > now => {
                        debug!(event_id = %event.id, "event has not started yet");
                    }
                    _ => {
                        warn!(
                            event_id = %event.id,
                            mod_number = event.mod_number,
                            "no interval covers the current instant"
                        );
                    }
                }
                continue;
            }
        };

        if event.test_event {
            debug!(event_id = %event.id, "ignoring test event");
            continue;
        }

        if optouts.contains(&event.id) {
            debug!(event_id = %event.id, "ignoring opted-out event");
            continue;
        }

        // lower numeric priority supersedes; ties keep the earlier start
        match leading {
            Some(lead) if event.effective_priority() >= lead.effective_priority() => {}
            _ => {
                leading = Some(event);
                selection.level = interval.level;
            }
        }
    }

    selection.event_id = leading.map(|e| e.id.clone());
    selection
}

pub struct EventController {
    handler: Arc<EventHandler>,
    gate: Arc<Mutex<()>>,
    interval: Duration,
    callback: SignalCallback,
    current_level: RwLock<f64>,
    active_event: RwLock<Option<String>>,
    wake: Notify,
}

impl EventController {
    pub fn new(
        handler: Arc<EventHandler>,
        gate: Arc<Mutex<()>>,
        interval: Duration,
        callback: SignalCallback,
    ) -> Self {
        Self {
            handler,
            gate,
            interval,
            callback,
            current_level: RwLock::new(0.0),
            active_event: RwLock::new(None),
            wake: Notify::new(),
        }
    }

    /// Edge-triggered nudge: wakes the loop so updated events propagate
    /// without waiting for the next tick.
    pub fn events_updated(&self) {
        self.wake.notify_one();
    }

    /// The level most recently applied by the loop.
    pub async fn cached_signal_level(&self) -> f64 {
        *self.current_level.read().await
    }

    /// The event that drove the level on the last tick, if any.
    pub async fn active_event_id(&self) -> Option<String> {
        self.active_event.read().await.clone()
    }

    /// Re-run the selection against the live active set, without waiting
    /// for a tick and without side effects.
    pub async fn current_signal_level(&self) -> Result<(f64, Option<String>)> {
        let events = self.handler.active_events().await?;
        let optouts = self.handler.optout_snapshot().await;
        let selection = select_signal(&events, &optouts, Utc::now());
        Ok((selection.level, selection.event_id))
    }

    async fn tick(&self) {
        let _guard = self.gate.lock().await;

        let events = match self.handler.active_events().await {
            Ok(events) => events,
            Err(err) => {
                error!(error = %err, "failed to load active events");
                return;
            }
        };

        let optouts = self.handler.optout_snapshot().await;
        let selection = select_signal(&events, &optouts, Utc::now());
        debug!(level = selection.level, "control states updated");

        if !selection.expired.is_empty() {
            debug!(events = ?selection.expired, "removing completed or cancelled events");
            if let Err(err) = self.handler.remove_events(&selection.expired).await {
                error!(error = %err, "failed to remove expired events");
            }
        }

        *self.active_event.write().await = selection.event_id.clone();

        let mut current = self.current_level.write().await;
        if selection.level != *current {
            if let Err(err) = (self.callback)(*current, selection.level) {
                error!(error = %err, "signal change callback failed");
            }
            *current = selection.level;
        }
    }

    /// Spawn the loop. It runs a tick immediately, then waits for the
    /// next interval, a nudge, or shutdown. Errors never stop it.
    pub fn spawn(self: Arc<Self>) -> (mpsc::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                self.tick().await;
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("control loop exiting");
                        break;
                    }
                    _ = self.wake.notified() => {}
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        });

        (shutdown_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SignalInterval, TargetSets};
    use chrono::Duration as ChronoDuration;

    fn event(id: &str, start: DateTime<Utc>, status: EventStatus, signals: &[(i64, f64)]) -> Event {
        let signals: Vec<SignalInterval> = signals
            .iter()
            .enumerate()
            .map(|(i, (secs, level))| SignalInterval {
                index: i as u32,
                duration: ChronoDuration::seconds(*secs),
                level: *level,
            })
            .collect();
        let mut event = Event {
            id: id.into(),
            mod_number: 1,
            status,
            priority: 1,
            market_context: None,
            test_event: false,
            original_start: start,
            start,
            start_offset_bound: None,
            cancellation_offset: None,
            end: None,
            signals,
            targets: TargetSets::default(),
        };
        event.end = event.nominal_end();
        event
    }

    fn selected(events: &[Event], now: DateTime<Utc>) -> (f64, Option<String>, Vec<String>) {
        let s = select_signal(events, &Default::default(), now);
        (s.level, s.event_id, s.expired)
    }

    #[test]
    fn single_active_event_with_single_interval() {
        let now = Utc::now();
        let events = vec![event(
            "FooEvent",
            now - ChronoDuration::minutes(1),
            EventStatus::Active,
            &[(5 * 3600, 1.0)],
        )];

        assert_eq!(
            selected(&events, now),
            (1.0, Some("FooEvent".into()), vec![])
        );
        // before the start nothing is selected
        assert_eq!(
            selected(&events, now - ChronoDuration::minutes(2)),
            (0.0, None, vec![])
        );
    }

    #[test]
    fn multi_interval_crossover() {
        let now = Utc::now();
        let events = vec![event(
            "FooEvent",
            now - ChronoDuration::hours(4) - ChronoDuration::minutes(1),
            EventStatus::Active,
            &[(4 * 3600, 3.0), (4 * 3600, 2.0)],
        )];

        assert_eq!(
            selected(&events, now),
            (2.0, Some("FooEvent".into()), vec![])
        );
    }

    #[test]
    fn pending_event_contributes_once_started() {
        let now = Utc::now();
        let events = vec![event(
            "FooEvent",
            now + ChronoDuration::seconds(60),
            EventStatus::Pending,
            &[(10, 1.0)],
        )];

        assert_eq!(selected(&events, now), (0.0, None, vec![]));
        assert_eq!(
            selected(&events, now + ChronoDuration::seconds(61)),
            (1.0, Some("FooEvent".into()), vec![])
        );
    }

    #[test]
    fn ended_event_is_expired() {
        let now = Utc::now();
        let events = vec![
            event(
                "FooEvent1",
                now - ChronoDuration::seconds(10),
                EventStatus::Completed,
                &[(5, 1.0)],
            ),
            event(
                "FooEvent2",
                now - ChronoDuration::seconds(5),
                EventStatus::Pending,
                &[(20, 2.0)],
            ),
        ];

        assert_eq!(
            selected(&events, now),
            (2.0, Some("FooEvent2".into()), vec!["FooEvent1".into()])
        );
    }

    #[test]
    fn cancelled_event_keeps_driving_until_its_end_lapses() {
        let now = Utc::now();
        let mut evt = event(
            "FooEvent",
            now - ChronoDuration::seconds(60),
            EventStatus::Cancelled,
            &[(120, 1.0)],
        );
        evt.end = Some(now + ChronoDuration::seconds(10));
        assert_eq!(
            selected(&[evt.clone()], now),
            (1.0, Some("FooEvent".into()), vec![])
        );

        evt.end = Some(now - ChronoDuration::seconds(10));
        assert_eq!(
            selected(&[evt], now),
            (0.0, None, vec!["FooEvent".into()])
        );
    }

    #[test]
    fn test_events_are_tracked_but_silent() {
        let now = Utc::now();
        let mut evt = event(
            "TestEvent",
            now - ChronoDuration::seconds(60),
            EventStatus::Active,
            &[(600, 1.0)],
        );
        evt.test_event = true;

        assert_eq!(selected(&[evt], now), (0.0, None, vec![]));
    }

    #[test]
    fn selection_prefers_lower_numeric_priority() {
        let now = Utc::now();
        // both active, distinct market contexts do not matter here
        let mut high = event(
            "HighPriority",
            now - ChronoDuration::seconds(30),
            EventStatus::Active,
            &[(600, 1.0)],
        );
        high.priority = 1;
        let mut low = event(
            "LowPriority",
            now - ChronoDuration::seconds(60),
            EventStatus::Active,
            &[(600, 2.0)],
        );
        low.priority = 2;

        // events arrive sorted by start; priority 1 supersedes priority 2
        assert_eq!(
            selected(&[low.clone(), high.clone()], now),
            (1.0, Some("HighPriority".into()), vec![])
        );

        // unprioritized (0) ranks below any explicit priority
        low.priority = 0;
        assert_eq!(
            selected(&[low, high], now),
            (1.0, Some("HighPriority".into()), vec![])
        );
    }

    #[test]
    fn priority_tie_goes_to_the_first_activated() {
        let now = Utc::now();
        let first = event(
            "First",
            now - ChronoDuration::seconds(120),
            EventStatus::Active,
            &[(600, 1.5)],
        );
        let second = event(
            "Second",
            now - ChronoDuration::seconds(60),
            EventStatus::Active,
            &[(600, 3.0)],
        );

        assert_eq!(
            selected(&[first, second], now),
            (1.5, Some("First".into()), vec![])
        );
    }

    #[test]
    fn opted_out_events_are_silent_but_still_expire() {
        let now = Utc::now();
        let running = event(
            "OptedOut",
            now - ChronoDuration::seconds(60),
            EventStatus::Active,
            &[(600, 1.0)],
        );
        let optouts: std::collections::HashSet<String> = ["OptedOut".to_string()].into();

        let s = select_signal(std::slice::from_ref(&running), &optouts, now);
        assert_eq!((s.level, s.event_id), (0.0, None));

        let mut lapsed = running;
        lapsed.status = EventStatus::Cancelled;
        lapsed.end = Some(now - ChronoDuration::seconds(1));
        let s = select_signal(&[lapsed], &optouts, now);
        assert_eq!(s.expired, vec!["OptedOut".to_string()]);
    }

    #[test]
    fn unending_event_stays_selected() {
        let now = Utc::now();
        let events = vec![event(
            "Unending",
            now - ChronoDuration::days(30),
            EventStatus::Active,
            &[(0, 4.0)],
        )];

        assert_eq!(
            selected(&events, now),
            (4.0, Some("Unending".into()), vec![])
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let now = Utc::now();
        let events = vec![
            event(
                "A",
                now - ChronoDuration::seconds(10),
                EventStatus::Active,
                &[(600, 1.0)],
            ),
            event(
                "B",
                now - ChronoDuration::seconds(5),
                EventStatus::Active,
                &[(600, 2.0)],
            ),
        ];
        let first = selected(&events, now);
        for _ in 0..10 {
            assert_eq!(selected(&events, now), first);
        }
    }
}
