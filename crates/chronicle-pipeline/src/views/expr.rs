//! Portable views built from [`Table`] operations.

use std::collections::{BTreeMap, HashMap, HashSet};

use chronicle_types::{ChronicleError, Result, Table, Value};

use crate::ir;
use crate::store::codec::{from_micros, to_micros};

pub const HOUR_MICROS: i64 = 3_600_000_000;
pub const DAY_MICROS: i64 = 24 * HOUR_MICROS;

fn required<'a>(row: &chronicle_types::RowView<'a>, column: &str) -> Result<&'a Value> {
    row.get(column)
        .ok_or_else(|| ChronicleError::InvalidTable(format!("no column named '{column}'")))
}

/// Rows with non-empty text.
pub fn messages_with_text(table: Table) -> Result<Table> {
    required_column(&table, "text")?;
    Ok(table.filter(|row| {
        matches!(row.get("text"), Some(Value::Utf8(s)) if !s.is_empty())
    }))
}

/// Rows carrying a media reference.
pub fn messages_with_media(table: Table) -> Result<Table> {
    required_column(&table, "media_url")?;
    Ok(table.filter(|row| row.get("media_url").is_some_and(|v| !v.is_null())))
}

/// Adds `chunk_idx`: the 0-based position of each message within its thread,
/// ordered by `(ts, event_id)`. Row order is preserved.
pub fn chunks(table: Table) -> Result<Table> {
    let mut keyed = Vec::with_capacity(table.len());
    for row in table.iter() {
        let thread = required(&row, "thread_id")?.to_string();
        let ts = required(&row, "ts")?.as_timestamp();
        let event = required(&row, "event_id")?.as_uuid();
        keyed.push((thread, ts, event, row.index()));
    }
    let mut order: Vec<usize> = (0..keyed.len()).collect();
    order.sort_by(|&a, &b| {
        let (ka, kb) = (&keyed[a], &keyed[b]);
        (ka.1, ka.2).cmp(&(kb.1, kb.2))
    });

    let mut next: HashMap<&str, i64> = HashMap::new();
    let mut chunk_idx = vec![Value::Null; keyed.len()];
    for i in order {
        let counter = next.entry(keyed[i].0.as_str()).or_insert(0);
        chunk_idx[keyed[i].3] = Value::Int64(*counter);
        *counter += 1;
    }
    table.with_column(ir::chunk_idx_column(), chunk_idx)
}

pub fn hourly_aggregates(table: Table) -> Result<Table> {
    activity(&table, HOUR_MICROS)
}

pub fn daily_aggregates(table: Table) -> Result<Table> {
    activity(&table, DAY_MICROS)
}

#[derive(Default)]
struct Bucket {
    count: i64,
    authors: HashSet<String>,
    first: i64,
    last: i64,
}

/// Per-bucket message counts, distinct authors, first and last message.
/// Buckets are UTC-aligned and emitted in ascending order.
fn activity(table: &Table, bucket_micros: i64) -> Result<Table> {
    let mut buckets: BTreeMap<i64, Bucket> = BTreeMap::new();
    for row in table.iter() {
        let ts = required(&row, "ts")?
            .as_timestamp()
            .map(to_micros)
            .ok_or_else(|| ChronicleError::InvalidTable("ts must be a timestamp".into()))?;
        let start = ts - ts.rem_euclid(bucket_micros);
        let bucket = buckets.entry(start).or_insert_with(|| Bucket {
            first: ts,
            last: ts,
            ..Default::default()
        });
        bucket.count += 1;
        bucket.first = bucket.first.min(ts);
        bucket.last = bucket.last.max(ts);
        let author = required(&row, "author_uuid")?;
        if !author.is_null() {
            bucket.authors.insert(author.to_string());
        }
    }

    let rows = buckets
        .into_iter()
        .map(|(start, b)| {
            Ok(vec![
                Value::Timestamp(from_micros(start)?),
                Value::Int64(b.count),
                Value::Int64(b.authors.len() as i64),
                Value::Timestamp(from_micros(b.first)?),
                Value::Timestamp(from_micros(b.last)?),
            ])
        })
        .collect::<Result<Vec<_>>>()?;
    Table::new(ir::activity_v1_columns(), rows)
}

fn required_column(table: &Table, column: &str) -> Result<()> {
    table
        .column_index(column)
        .map(|_| ())
        .ok_or_else(|| ChronicleError::InvalidTable(format!("no column named '{column}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::builtin::tests::sample_events;

    #[test]
    fn text_filter_drops_null_and_empty() {
        let out = messages_with_text(sample_events()).unwrap();
        assert!(out
            .iter()
            .all(|r| matches!(r.get("text"), Some(Value::Utf8(s)) if !s.is_empty())));
        assert!(out.len() < sample_events().len());
    }

    #[test]
    fn chunk_idx_counts_per_thread_in_time_order() {
        let input = sample_events();
        let out = chunks(input.clone()).unwrap();
        assert_eq!(out.len(), input.len());

        let mut per_thread: HashMap<String, Vec<(i64, i64)>> = HashMap::new();
        for row in out.iter() {
            let thread = row.get("thread_id").unwrap().to_string();
            let ts = to_micros(row.get("ts").unwrap().as_timestamp().unwrap());
            let idx = row.get("chunk_idx").unwrap().as_i64().unwrap();
            per_thread.entry(thread).or_default().push((ts, idx));
        }
        for (_, mut entries) in per_thread {
            entries.sort();
            let idxs: Vec<i64> = entries.iter().map(|e| e.1).collect();
            assert_eq!(idxs, (0..idxs.len() as i64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn daily_activity_counts_every_message() {
        let input = sample_events();
        let out = daily_aggregates(input.clone()).unwrap();
        let total: i64 = out
            .iter()
            .map(|r| r.get("message_count").unwrap().as_i64().unwrap())
            .sum();
        assert_eq!(total, input.len() as i64);
        for row in out.iter() {
            let bucket = row.get("bucket").unwrap().as_timestamp().unwrap();
            assert_eq!(to_micros(bucket) % DAY_MICROS, 0);
        }
    }

    #[test]
    fn missing_column_is_an_error() {
        let input = sample_events().drop_column("text").unwrap();
        assert!(messages_with_text(input).is_err());
    }
}
