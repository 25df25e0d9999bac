//! Event persistence.
//!
//! The store keeps events and their signal intervals with atomic writes
//! and cascade delete of intervals. Timestamps and durations are stored
//! as ISO-8601 text to avoid lossy numeric conversion.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tokio::sync::RwLock;

use crate::event::{Event, EventStatus, SignalInterval};
use crate::schedule;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event and its intervals. Fails if the id exists.
    async fn add(&self, event: &Event) -> Result<()>;
    /// Replace an event and its intervals by id.
    async fn update(&self, event: &Event) -> Result<()>;
    async fn get(&self, event_id: &str) -> Result<Option<Event>>;
    /// Remove events and their intervals.
    async fn remove(&self, event_ids: &[String]) -> Result<()>;
    /// All currently stored events, sorted by effective start ascending.
    async fn active(&self) -> Result<Vec<Event>>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                mod_number INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                test_event INTEGER NOT NULL DEFAULT 0,
                market_context TEXT,
                original_start TEXT NOT NULL,
                start TEXT NOT NULL,
                start_offset_bound TEXT,
                cancellation_offset TEXT,
                end_time TEXT,
                targets_json TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intervals (
                event_id TEXT NOT NULL REFERENCES events(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                duration TEXT NOT NULL,
                level REAL NOT NULL,
                PRIMARY KEY (event_id, idx)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn intervals_for(&self, event_id: &str) -> Result<Vec<SignalInterval>> {
        let rows = sqlx::query(
            "SELECT idx, duration, level FROM intervals WHERE event_id = ? ORDER BY idx ASC",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SignalInterval {
                    index: row.get::<i64, _>("idx") as u32,
                    duration: schedule::parse_duration(row.get("duration"))?,
                    level: row.get("level"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn add(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO events (id, mod_number, status, priority, test_event, market_context,
                                original_start, start, start_offset_bound, cancellation_offset,
                                end_time, targets_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(event.mod_number as i64)
        .bind(event.status.as_str())
        .bind(event.priority)
        .bind(event.test_event)
        .bind(&event.market_context)
        .bind(schedule::format_datetime(event.original_start))
        .bind(schedule::format_datetime(event.start))
        .bind(event.start_offset_bound.map(schedule::format_duration))
        .bind(event.cancellation_offset.map(schedule::format_duration))
        .bind(event.end.map(schedule::format_datetime))
        .bind(serde_json::to_string(&event.targets)?)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("insert of event {} failed", event.id))?;

        insert_intervals(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, event: &Event) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE events
            SET mod_number = ?, status = ?, priority = ?, test_event = ?, market_context = ?,
                original_start = ?, start = ?, start_offset_bound = ?, cancellation_offset = ?,
                end_time = ?, targets_json = ?
            WHERE id = ?
            "#,
        )
        .bind(event.mod_number as i64)
        .bind(event.status.as_str())
        .bind(event.priority)
        .bind(event.test_event)
        .bind(&event.market_context)
        .bind(schedule::format_datetime(event.original_start))
        .bind(schedule::format_datetime(event.start))
        .bind(event.start_offset_bound.map(schedule::format_duration))
        .bind(event.cancellation_offset.map(schedule::format_duration))
        .bind(event.end.map(schedule::format_datetime))
        .bind(serde_json::to_string(&event.targets)?)
        .bind(&event.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            bail!("event {} does not exist", event.id);
        }

        sqlx::query("DELETE FROM intervals WHERE event_id = ?")
            .bind(&event.id)
            .execute(&mut *tx)
            .await?;
        insert_intervals(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let signals = self.intervals_for(event_id).await?;
                Ok(Some(row_to_event(row, signals)?))
            }
            None => Ok(None),
        }
    }

    async fn remove(&self, event_ids: &[String]) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in event_ids {
            // explicit interval delete keeps us correct even with
            // foreign keys disabled on an inherited connection
            sqlx::query("DELETE FROM intervals WHERE event_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM events WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn active(&self) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY start ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let signals = self.intervals_for(&id).await?;
            events.push(row_to_event(row, signals)?);
        }
        Ok(events)
    }
}

async fn insert_intervals(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &Event,
) -> Result<()> {
    for signal in &event.signals {
        sqlx::query("INSERT INTO intervals (event_id, idx, duration, level) VALUES (?, ?, ?, ?)")
            .bind(&event.id)
            .bind(signal.index as i64)
            .bind(schedule::format_duration(signal.duration))
            .bind(signal.level)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn row_to_event(row: SqliteRow, signals: Vec<SignalInterval>) -> Result<Event> {
    let targets_json: String = row.get("targets_json");
    Ok(Event {
        id: row.get("id"),
        mod_number: row.get::<i64, _>("mod_number") as u32,
        status: EventStatus::from_wire(row.get("status")),
        priority: row.get("priority"),
        test_event: row.get("test_event"),
        market_context: row.get("market_context"),
        original_start: schedule::parse_datetime(row.get("original_start"))?,
        start: schedule::parse_datetime(row.get("start"))?,
        start_offset_bound: row
            .get::<Option<String>, _>("start_offset_bound")
            .map(|d| schedule::parse_duration(&d))
            .transpose()?,
        cancellation_offset: row
            .get::<Option<String>, _>("cancellation_offset")
            .map(|d| schedule::parse_duration(&d))
            .transpose()?,
        end: row
            .get::<Option<String>, _>("end_time")
            .map(|t| schedule::parse_datetime(&t))
            .transpose()?,
        signals,
        targets: serde_json::from_str(&targets_json)?,
    })
}

/// Map-backed store for tests and diskless deployments.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<String, Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn add(&self, event: &Event) -> Result<()> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.id) {
            bail!("event {} already exists", event.id);
        }
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn update(&self, event: &Event) -> Result<()> {
        let mut events = self.events.write().await;
        if !events.contains_key(&event.id) {
            bail!("event {} does not exist", event.id);
        }
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn remove(&self, event_ids: &[String]) -> Result<()> {
        let mut events = self.events.write().await;
        for id in event_ids {
            events.remove(id);
        }
        Ok(())
    }

    async fn active(&self) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut all: Vec<Event> = events.values().cloned().collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TargetSets;
    use chrono::{Duration, Utc};

    fn sample(id: &str, level: f64) -> Event {
        let start = Utc::now();
        let mut event = Event {
            id: id.into(),
            mod_number: 1,
            status: EventStatus::Active,
            priority: 1,
            market_context: Some("http://some-url".into()),
            test_event: false,
            original_start: start,
            start,
            start_offset_bound: Some(Duration::minutes(2)),
            cancellation_offset: Some(Duration::minutes(2)),
            end: None,
            signals: vec![
                SignalInterval {
                    index: 0,
                    duration: Duration::hours(4),
                    level,
                },
                SignalInterval {
                    index: 1,
                    duration: Duration::hours(1),
                    level: level / 2.0,
                },
            ],
            targets: TargetSets {
                ven_ids: vec!["ven_py".into()],
                ..TargetSets::default()
            },
        };
        event.end = event.nominal_end();
        event
    }

    async fn exercise_store(store: &dyn EventStore) {
        let event = sample("FooEvent", 3.0);
        store.add(&event).await.unwrap();

        // adding twice is an error
        assert!(store.add(&event).await.is_err());

        let mut fetched = store.get("FooEvent").await.unwrap().unwrap();
        assert_eq!(fetched, event);
        assert!(store.get("NoSuchEvent").await.unwrap().is_none());

        fetched.mod_number = 2;
        fetched.status = EventStatus::Cancelled;
        fetched.end = Some(Utc::now() + Duration::minutes(1));
        fetched.signals.pop();
        store.update(&fetched).await.unwrap();
        let after = store.get("FooEvent").await.unwrap().unwrap();
        assert_eq!(after.mod_number, 2);
        assert_eq!(after.status, EventStatus::Cancelled);
        assert_eq!(after.signals.len(), 1);

        let mut second = sample("BarEvent", 1.0);
        second.start = second.start - Duration::hours(1);
        second.original_start = second.start;
        second.end = second.nominal_end();
        store.add(&second).await.unwrap();

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 2);
        // sorted by effective start ascending
        assert_eq!(active[0].id, "BarEvent");
        assert_eq!(active[1].id, "FooEvent");

        store
            .remove(&["FooEvent".to_string(), "BarEvent".to_string()])
            .await
            .unwrap();
        assert!(store.active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        exercise_store(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("events.db")).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_update_requires_existing_event() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("events.db")).await.unwrap();
        assert!(store.update(&sample("Ghost", 1.0)).await.is_err());
    }

    #[tokio::test]
    async fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let event = sample("FooEvent", 3.0);
        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.add(&event).await.unwrap();
        }
        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.get("FooEvent").await.unwrap().unwrap(), event);
    }
}
