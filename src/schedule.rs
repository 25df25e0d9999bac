//! ISO-8601 schedule primitives: duration and timestamp codecs plus the
//! bounded random offsets OpenADR uses to smear start and cancellation
//! times across a fleet.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SECS_PER_MINUTE: i64 = 60;
const SECS_PER_HOUR: i64 = 3_600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;
// iCalendar durations are nominal; years and months only ever appear as
// zero components in OpenADR payloads, so the approximation is safe.
const SECS_PER_MONTH: i64 = 30 * SECS_PER_DAY;
const SECS_PER_YEAR: i64 = 365 * SECS_PER_DAY;

/// Parse an ISO-8601 duration (`PnYnMnDTnHnMnS`, also `PnW`), with an
/// optional leading sign.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let (sign, s) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let body = s
        .strip_prefix(['P', 'p'])
        .with_context(|| format!("duration {input:?} does not start with 'P'"))?;

    let mut total: i64 = 0;
    let mut in_time = false;
    let mut saw_component = false;
    let mut digits = String::new();

    for c in body.chars() {
        match c {
            'T' | 't' => {
                if in_time || !digits.is_empty() {
                    bail!("malformed duration {input:?}");
                }
                in_time = true;
            }
            '0'..='9' => digits.push(c),
            _ => {
                let value: i64 = digits
                    .parse()
                    .with_context(|| format!("malformed duration {input:?}"))?;
                digits.clear();
                saw_component = true;
                let unit = match (c.to_ascii_uppercase(), in_time) {
                    ('Y', false) => SECS_PER_YEAR,
                    ('M', false) => SECS_PER_MONTH,
                    ('W', false) => SECS_PER_WEEK,
                    ('D', false) => SECS_PER_DAY,
                    ('H', true) => SECS_PER_HOUR,
                    ('M', true) => SECS_PER_MINUTE,
                    ('S', true) => 1,
                    _ => bail!("unexpected designator {c:?} in duration {input:?}"),
                };
                total += value * unit;
            }
        }
    }

    if !digits.is_empty() || !saw_component {
        bail!("malformed duration {input:?}");
    }
    Ok(Duration::seconds(sign * total))
}

/// Format a duration in the canonical `PnDTnHnMnS` form used for
/// persistence. Round-trips through [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.num_seconds();
    let mut out = String::new();
    if secs < 0 {
        out.push('-');
        secs = -secs;
    }
    out.push('P');
    let days = secs / SECS_PER_DAY;
    secs %= SECS_PER_DAY;
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    let hours = secs / SECS_PER_HOUR;
    let minutes = (secs % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = secs % SECS_PER_MINUTE;
    if hours > 0 || minutes > 0 || seconds > 0 || days == 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if seconds > 0 || (hours == 0 && minutes == 0) {
            out.push_str(&format!("{seconds}S"));
        }
    }
    out
}

/// Parse an OpenADR timestamp. VTNs send RFC 3339 (`2020-03-18T08:00:00Z`);
/// naive timestamps without an offset are taken as UTC.
pub fn parse_datetime(input: &str) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .with_context(|| format!("unparseable timestamp {input:?}"))?;
    Ok(naive.and_utc())
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Draw from `[0, bound]`, seeded by `(event_id, salt)` so the same event
/// always draws the same offset.
fn bounded_offset(event_id: &str, salt: &str, bound: Duration) -> Duration {
    let secs = bound.num_seconds();
    if secs <= 0 {
        return Duration::zero();
    }
    let mut hasher = DefaultHasher::new();
    event_id.hash(&mut hasher);
    salt.hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());
    Duration::seconds(rng.gen_range(0..=secs))
}

/// The start smear drawn from the event's `startafter` tolerance.
pub fn start_offset(event_id: &str, bound: Duration) -> Duration {
    bounded_offset(event_id, "startafter", bound)
}

/// The cancellation-tail smear applied to an active event's end.
pub fn cancel_offset(event_id: &str, bound: Duration) -> Duration {
    bounded_offset(event_id, "cancel", bound)
}
