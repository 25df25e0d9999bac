//! OpenADR 2.0a Virtual End Node (VEN) core.
//!
//! The VEN receives event broadcasts from a Virtual Top Node, runs each
//! event through an acceptance pipeline, persists accepted events, and
//! computes the scalar signal level downstream control equipment must
//! follow. Ingest ([`handler`]) and the control loop ([`controller`])
//! share one event store behind the [`ven::Ven`] supervisor; the
//! [`poll`] carrier feeds broadcasts in over HTTP.

pub mod config;
pub mod controller;
pub mod event;
pub mod handler;
pub mod oadr;
pub mod poll;
pub mod schedule;
pub mod store;
pub mod ven;

pub use config::{OadrProfile, VenConfig};
pub use controller::{select_signal, EventController, Selection, SignalCallback};
pub use event::{Event, EventStatus, SignalInterval, TargetSets};
pub use handler::EventHandler;
pub use poll::{PollClient, PollConfig};
pub use store::{EventStore, MemoryStore, SqliteStore};
pub use ven::Ven;
