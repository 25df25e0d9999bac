//! Typed model of a demand-response event and its signal profile.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Active,
    Cancelled,
    Completed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Active => "active",
            EventStatus::Cancelled => "cancelled",
            EventStatus::Completed => "completed",
        }
    }

    /// Map a wire or stored status string. `far`, `near` and `none` are the
    /// protocol's pre-active phases and collapse to [`EventStatus::Pending`],
    /// as does anything unrecognized.
    pub fn from_wire(s: &str) -> EventStatus {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => EventStatus::Active,
            "cancelled" | "canceled" => EventStatus::Cancelled,
            "completed" => EventStatus::Completed,
            _ => EventStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Cancelled | EventStatus::Completed)
    }
}

/// One segment of an event's signal profile.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInterval {
    pub index: u32,
    pub duration: Duration,
    pub level: f64,
}

/// Target selectors of an event. Empty sets mean "everyone".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetSets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ven_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub party_ids: Vec<String>,
}

impl TargetSets {
    pub fn is_empty(&self) -> bool {
        self.ven_ids.is_empty()
            && self.group_ids.is_empty()
            && self.resource_ids.is_empty()
            && self.party_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub mod_number: u32,
    pub status: EventStatus,
    pub priority: i64,
    pub market_context: Option<String>,
    pub test_event: bool,
    /// Start instant as supplied by the VTN.
    pub original_start: DateTime<Utc>,
    /// Effective start: `original_start` plus the offset drawn from
    /// `startafter`. The draw happens once per event id and is preserved
    /// across modifications that keep the same bound.
    pub start: DateTime<Utc>,
    /// The `startafter` tolerance, when the VTN sent one.
    pub start_offset_bound: Option<Duration>,
    /// Bound for the randomized tail appended when an active event is
    /// cancelled.
    pub cancellation_offset: Option<Duration>,
    /// `None` for an unending event (zero summed interval duration); such
    /// an event only gains an end through cancellation.
    pub end: Option<DateTime<Utc>>,
    /// Signal profile, ordered by interval index.
    pub signals: Vec<SignalInterval>,
    pub targets: TargetSets,
}

impl Event {
    pub fn total_duration(&self) -> Duration {
        self.signals
            .iter()
            .fold(Duration::zero(), |acc, s| acc + s.duration)
    }

    /// An event whose summed interval durations are zero runs until
    /// explicitly cancelled.
    pub fn is_unending(&self) -> bool {
        !self.signals.is_empty() && self.total_duration().is_zero()
    }

    /// Nominal end derived from the effective start and the signal profile.
    pub fn nominal_end(&self) -> Option<DateTime<Utc>> {
        if self.signals.is_empty() || self.is_unending() {
            None
        } else {
            Some(self.start + self.total_duration())
        }
    }

    /// Priority for overlap resolution: lower numeric value supersedes;
    /// zero (and anything negative) means unprioritized and sorts last.
    pub fn effective_priority(&self) -> i64 {
        if self.priority <= 0 {
            i64::MAX
        } else {
            self.priority
        }
    }

    /// The interval whose window `[cumulative_start, cumulative_end)`
    /// contains `now`, walking the profile in index order from the
    /// effective start. The unending sentinel is current for any instant
    /// at or past the start.
    pub fn current_interval(&self, now: DateTime<Utc>) -> Option<&SignalInterval> {
        if now < self.start {
            return None;
        }
        if self.is_unending() {
            return self.signals.first();
        }
        let mut window_start = self.start;
        for signal in &self.signals {
            let window_end = window_start + signal.duration;
            if now >= window_start && now < window_end {
                return Some(signal);
            }
            window_start = window_end;
        }
        None
    }

    /// Cancel as of `now`, on behalf of whatever state the VEN held for the
    /// event: an interrupted active event gets the randomized tail drawn
    /// from `cancellation_offset`, anything else ends immediately.
    pub fn cancel_from(&mut self, prior_status: EventStatus, now: DateTime<Utc>) {
        self.end = Some(if prior_status == EventStatus::Active {
            match self.cancellation_offset {
                Some(bound) => now + schedule::cancel_offset(&self.id, bound),
                None => now,
            }
        } else {
            now
        });
        self.status = EventStatus::Cancelled;
    }

    /// Cancel a stored event in place (the implicit-cancellation path).
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.cancel_from(self.status, now);
    }
}
