//! Partitioning an ordered event stream into processing windows.
//!
//! Count windows close after `size` new events. Time windows cover periods
//! of `size` hours or days on the UTC grid anchored at the first event's
//! hour or day; periods without events produce no window. Either way the
//! next window re-includes the trailing `floor(len * overlap)` events of
//! the one just closed.
//!
//! Byte windows pack events until their serialized JSON size would exceed
//! `size` bytes, ignoring time boundaries. A single event larger than the
//! budget still gets a window of its own. Overlap there is a byte budget:
//! the trailing events fitting in `floor(size * overlap)` bytes are carried,
//! always leaving at least one event behind.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use chronicle_types::{ChronicleError, Result, RowView, Table, Window, WindowKey};

const HOUR_MICROS: i64 = 3_600_000_000;
const DAY_MICROS: i64 = 24 * HOUR_MICROS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowUnit {
    Messages,
    Hours,
    Days,
    Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPolicy {
    pub unit: WindowUnit,
    pub size: u32,
    /// Fraction of each closed window re-included in the next, in `[0, 1)`.
    pub overlap: f64,
    /// Upper bound on a time window's span, in hours.
    pub max_window_hours: Option<u32>,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            unit: WindowUnit::Days,
            size: 1,
            overlap: 0.0,
            max_window_hours: None,
        }
    }
}

impl WindowPolicy {
    pub fn messages(size: u32) -> Self {
        Self {
            unit: WindowUnit::Messages,
            size,
            ..Default::default()
        }
    }

    pub fn hours(size: u32) -> Self {
        Self {
            unit: WindowUnit::Hours,
            size,
            ..Default::default()
        }
    }

    pub fn days(size: u32) -> Self {
        Self {
            unit: WindowUnit::Days,
            size,
            ..Default::default()
        }
    }

    /// Pack events up to `max_bytes` of serialized rows per window.
    pub fn bytes(max_bytes: u32) -> Self {
        Self {
            unit: WindowUnit::Bytes,
            size: max_bytes,
            ..Default::default()
        }
    }

    pub fn with_overlap(mut self, overlap: f64) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_max_window_hours(mut self, hours: u32) -> Self {
        self.max_window_hours = Some(hours);
        self
    }
}

/// Event-time filter: `from` inclusive, `to` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts < to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Count(usize),
    /// Byte budget per window.
    Bytes(u64),
    /// Period length and grid alignment, both in microseconds.
    Period { micros: i64, align: i64 },
}

// ---------------------------------------------------------------------------
// WindowPlanner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WindowPlanner {
    policy: WindowPolicy,
    range: DateRange,
    step: Step,
}

impl WindowPlanner {
    pub fn new(policy: WindowPolicy) -> Result<Self> {
        if policy.size == 0 {
            return Err(ChronicleError::WindowIntegrity(
                "window size must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&policy.overlap) {
            return Err(ChronicleError::WindowIntegrity(format!(
                "overlap must be in [0, 1), got {}",
                policy.overlap
            )));
        }
        if policy.max_window_hours == Some(0) {
            return Err(ChronicleError::WindowIntegrity(
                "max_window_hours must be at least 1".into(),
            ));
        }
        let step = effective_step(&policy)?;
        Ok(Self {
            policy,
            range: DateRange::default(),
            step,
        })
    }

    pub fn with_range(mut self, range: DateRange) -> Self {
        self.range = range;
        self
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    /// Span of one time window after clamping; `None` for count windows.
    pub fn period(&self) -> Option<TimeDelta> {
        match self.step {
            Step::Count(_) | Step::Bytes(_) => None,
            Step::Period { micros, .. } => Some(TimeDelta::microseconds(micros)),
        }
    }

    /// Cut `window` into `parts` equal spans of time. Every part but the last
    /// is half-open; the last also keeps events at `end`. Parts with no
    /// events are dropped, and each part keeps the window's index.
    pub fn split(window: &Window, parts: usize) -> Result<Vec<Window>> {
        if parts < 2 {
            return Err(ChronicleError::WindowIntegrity(format!(
                "cannot split window {} into {parts} part(s)",
                window.key
            )));
        }
        if window.rows.column_index("ts").is_none() {
            return Err(ChronicleError::InvalidTable(
                "window rows have no 'ts' column".into(),
            ));
        }
        let span = (window.key.end - window.key.start)
            .num_microseconds()
            .ok_or_else(|| {
                ChronicleError::WindowIntegrity(format!("window {} is too long to split", window.key))
            })?;
        let step = span / parts as i64;

        let mut out = Vec::new();
        for i in 0..parts {
            let last = i + 1 == parts;
            let start = window.key.start + TimeDelta::microseconds(step * i as i64);
            let end = if last {
                window.key.end
            } else {
                window.key.start + TimeDelta::microseconds(step * (i as i64 + 1))
            };
            let inside = |ts: Option<DateTime<Utc>>| {
                ts.is_some_and(|ts| ts >= start && (ts < end || (last && ts == end)))
            };
            let ts_of = |row: &RowView<'_>| row.get("ts").and_then(|v| v.as_timestamp());

            let rows = window.rows.filter(|row| inside(ts_of(row)));
            if rows.is_empty() {
                continue;
            }
            let carried = window
                .rows
                .iter()
                .filter(|row| row.index() < window.carried && inside(ts_of(row)))
                .count();
            out.push(Window {
                key: WindowKey {
                    tenant_id: window.key.tenant_id.clone(),
                    source: window.key.source.clone(),
                    start,
                    end,
                },
                index: window.index,
                carried,
                rows,
            });
        }
        Ok(out)
    }

    /// Plan windows over `events`, which must be ordered by `ts`. The
    /// returned iterator is lazy; planning again starts over and yields the
    /// same windows.
    pub fn plan<'a>(&self, tenant_id: &str, source: &str, events: &'a Table) -> Windows<'a> {
        let mut windows = Windows {
            events,
            selected: Vec::new(),
            key: (tenant_id.to_string(), source.to_string()),
            step: self.step,
            overlap: self.policy.overlap,
            anchor: 0,
            pos: 0,
            carry: Vec::new(),
            sizes: Vec::new(),
            index: 0,
            seen: HashSet::new(),
            pending: None,
            done: false,
        };
        match select(events, &self.range) {
            Ok(selected) => {
                if let (Step::Period { align, .. }, Some(&(_, first))) = (self.step, selected.first()) {
                    let first = first.timestamp_micros();
                    windows.anchor = first - first.rem_euclid(align);
                }
                windows.selected = selected;
            }
            Err(e) => windows.pending = Some(e),
        }
        windows
    }
}

fn effective_step(policy: &WindowPolicy) -> Result<Step> {
    let unit_hours: u64 = match policy.unit {
        WindowUnit::Messages => return Ok(Step::Count(policy.size as usize)),
        WindowUnit::Bytes => return Ok(Step::Bytes(u64::from(policy.size))),
        WindowUnit::Hours => 1,
        WindowUnit::Days => 24,
    };
    let requested = u64::from(policy.size) * unit_hours;
    let hours = match policy.max_window_hours {
        Some(max) if requested > max as u64 => {
            let step = (max as f64 / (1.0 + policy.overlap)).floor() as u64;
            if step < 24 {
                step.max(1)
            } else {
                step / 24 * 24
            }
        }
        _ => requested,
    };
    let micros = i64::try_from(hours)
        .ok()
        .and_then(|h| h.checked_mul(HOUR_MICROS))
        .ok_or_else(|| {
            ChronicleError::WindowIntegrity(format!("a window of {hours} hours is too long"))
        })?;
    let align = if hours % 24 == 0 { DAY_MICROS } else { HOUR_MICROS };
    Ok(Step::Period { micros, align })
}

/// Row indices and timestamps of the events inside `range`, checking that
/// they are ordered by `ts`.
fn select(events: &Table, range: &DateRange) -> Result<Vec<(usize, DateTime<Utc>)>> {
    if events.column_index("ts").is_none() {
        return Err(ChronicleError::InvalidTable(
            "events have no 'ts' column".into(),
        ));
    }
    let mut selected = Vec::with_capacity(events.len());
    let mut last: Option<DateTime<Utc>> = None;
    for row in events.iter() {
        let ts = row.get("ts").and_then(|v| v.as_timestamp()).ok_or_else(|| {
            ChronicleError::WindowIntegrity(format!("event {} has no timestamp", row.index()))
        })?;
        if !range.contains(ts) {
            continue;
        }
        if let Some(prev) = last.filter(|prev| ts < *prev) {
            return Err(ChronicleError::WindowIntegrity(format!(
                "events are not ordered by ts: row {} at {ts} follows {prev}",
                row.index()
            )));
        }
        last = Some(ts);
        selected.push((row.index(), ts));
    }
    Ok(selected)
}

// ---------------------------------------------------------------------------
// Windows iterator
// ---------------------------------------------------------------------------

/// Lazy sequence of windows produced by [`WindowPlanner::plan`]. Fused after
/// the first error.
pub struct Windows<'a> {
    events: &'a Table,
    selected: Vec<(usize, DateTime<Utc>)>,
    key: (String, String),
    step: Step,
    overlap: f64,
    anchor: i64,
    pos: usize,
    /// Positions in `selected` re-included by the next window.
    carry: Vec<usize>,
    /// Serialized size of `selected[i]`, filled on demand for byte windows.
    sizes: Vec<u64>,
    index: usize,
    seen: HashSet<(DateTime<Utc>, DateTime<Utc>)>,
    pending: Option<ChronicleError>,
    done: bool,
}

impl Windows<'_> {
    fn at(&self, micros: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_micros(micros).ok_or_else(|| {
            ChronicleError::WindowIntegrity(format!("window bound out of range: {micros}"))
        })
    }

    fn size_of(&mut self, pos: usize) -> Result<u64> {
        while self.sizes.len() <= pos {
            let row = self.selected[self.sizes.len()].0;
            let record: serde_json::Map<String, serde_json::Value> = self
                .events
                .columns()
                .iter()
                .zip(&self.events.rows()[row])
                .map(|(col, value)| (col.name.clone(), value.to_json()))
                .collect();
            self.sizes.push(serde_json::to_vec(&record)?.len() as u64);
        }
        Ok(self.sizes[pos])
    }

    fn next_window(&mut self) -> Result<Window> {
        let len = self.selected.len();
        let (fresh_end, period) = match self.step {
            Step::Count(size) => ((self.pos + size).min(len), None),
            Step::Bytes(budget) => {
                let mut used = 0u64;
                for m in self.carry.clone() {
                    used += self.size_of(m)?;
                }
                let mut fresh_end = self.pos;
                while fresh_end < len {
                    let size = self.size_of(fresh_end)?;
                    if fresh_end > self.pos && used + size > budget {
                        break;
                    }
                    used += size;
                    fresh_end += 1;
                }
                (fresh_end, None)
            }
            Step::Period { micros, .. } => {
                let ts = self.selected[self.pos].1.timestamp_micros();
                let start = self.anchor + (ts - self.anchor) / micros * micros;
                let end = start.checked_add(micros).ok_or_else(|| {
                    ChronicleError::WindowIntegrity(format!("window bound out of range after {start}"))
                })?;
                let mut fresh_end = self.pos;
                while fresh_end < len && self.selected[fresh_end].1.timestamp_micros() < end {
                    fresh_end += 1;
                }
                (fresh_end, Some((start, end)))
            }
        };

        let members: Vec<usize> = self
            .carry
            .iter()
            .copied()
            .chain(self.pos..fresh_end)
            .collect();
        let first_ts = self.selected[members[0]].1;
        let last_ts = self.selected[members[members.len() - 1]].1;
        let (start, end) = match period {
            None => (first_ts, last_ts),
            Some((start, end)) => (self.at(start)?.min(first_ts), self.at(end)?),
        };

        let key = WindowKey {
            tenant_id: self.key.0.clone(),
            source: self.key.1.clone(),
            start,
            end,
        };
        if start > end {
            return Err(ChronicleError::WindowIntegrity(format!(
                "window {key} starts after it ends"
            )));
        }
        if !self.seen.insert((start, end)) {
            return Err(ChronicleError::WindowIntegrity(format!(
                "window {key} was planned twice in one pass"
            )));
        }

        let rows = members
            .iter()
            .map(|&m| self.events.rows()[self.selected[m].0].clone())
            .collect();
        let rows = Table::new(self.events.columns().to_vec(), rows)?;

        let carried = self.carry.len();
        let keep = match self.step {
            Step::Bytes(budget) => {
                let allowance = (budget as f64 * self.overlap).floor() as u64;
                let mut used = 0u64;
                let mut keep = 0;
                for &m in members[1..].iter().rev() {
                    used += self.size_of(m)?;
                    if used > allowance {
                        break;
                    }
                    keep += 1;
                }
                keep
            }
            _ => (members.len() as f64 * self.overlap).floor() as usize,
        };
        self.carry = members[members.len() - keep..].to_vec();
        self.pos = fresh_end;

        let window = Window {
            key,
            index: self.index,
            carried,
            rows,
        };
        self.index += 1;
        Ok(window)
    }
}

impl Iterator for Windows<'_> {
    type Item = Result<Window>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }
        if self.pos >= self.selected.len() {
            self.done = true;
            return None;
        }
        let result = self.next_window();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
