#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use annal::{Database, DomainEvent, EventPayload, EventStore, MetaData};
use rusqlite::Connection;
use serde_json::json;

pub fn open_connection() -> Connection {
    Database::open_in_memory()
        .expect("initialize database")
        .into_connection()
}

pub fn open_store() -> (Connection, EventStore) {
    (open_connection(), EventStore::new())
}

/// Events of one stub type for `aggregate_id`, at sequences
/// `offset..offset + count`.
pub fn stub_events(aggregate_id: &str, offset: u64, count: usize) -> Vec<DomainEvent> {
    (0..count as u64)
        .map(|i| {
            DomainEvent::new(
                aggregate_id,
                offset + i,
                EventPayload::new("StubStateChanged", json!({ "index": offset + i })),
            )
        })
        .collect()
}

/// A single event whose payload body is the given string.
pub fn payload_event(aggregate_id: &str, sequence: u64, body: &str) -> DomainEvent {
    DomainEvent::new(aggregate_id, sequence, EventPayload::new("Stub", json!(body)))
}

pub fn meta(key: &str, value: &str) -> MetaData {
    MetaData::from_entries([(key, json!(value))])
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })
    .expect("count rows")
}

static CLOCK_MUTEX: Mutex<()> = Mutex::new(());

/// Serializes access to the process clock and restores the system clock
/// when dropped. Every test that pins the clock must hold one of these.
pub struct ClockGuard(MutexGuard<'static, ()>);

impl Drop for ClockGuard {
    fn drop(&mut self) {
        annal::clock::reset();
    }
}

pub fn lock_clock() -> ClockGuard {
    ClockGuard(CLOCK_MUTEX.lock().unwrap_or_else(|e| e.into_inner()))
}
