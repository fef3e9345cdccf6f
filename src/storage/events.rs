//! Audit-event persistence.
//!
//! Events are append-only and written inside the same transaction as the
//! mutation they describe, so a crash between mutation and export loses only
//! the export, never the trail.

use rusqlite::Connection;

use crate::error::Result;
use crate::model::{Event, EventType};
use crate::util::time;

/// Append an event row. The `id` on the passed event is ignored; SQLite
/// assigns it.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            event.issue_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            time::to_rfc3339(event.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Events for one issue, newest first.
pub fn events_for(conn: &Connection, issue_id: &str, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events WHERE issue_id = ?
         ORDER BY created_at DESC, id DESC LIMIT ?",
    )?;
    let events = stmt
        .query_map(rusqlite::params![issue_id, limit as i64], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

/// Most recent events across all issues, newest first.
pub fn recent_events(conn: &Connection, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events ORDER BY created_at DESC, id DESC LIMIT ?",
    )?;
    let events = stmt
        .query_map([limit as i64], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(events)
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(2)?;
    let created_at: String = row.get(7)?;
    Ok(Event {
        id: row.get(0)?,
        issue_id: row.get(1)?,
        event_type: EventType::from(event_type.as_str()),
        actor: row.get(3)?,
        old_value: row.get(4)?,
        new_value: row.get(5)?,
        comment: row.get(6)?,
        created_at: time::parse_stored(&created_at)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
    })
}
