mod common;

use annal::{EntryKind, Error, EventStore};

#[test]
fn duplicate_sequence_number_raises_concurrency_error() {
    let (conn, store) = common::open_store();

    store
        .append_events(&conn, &[common::payload_event("123", 0, "Mock contents")])
        .unwrap();
    let err = store
        .append_events(&conn, &[common::payload_event("123", 0, "Mock contents")])
        .unwrap_err();

    match err {
        Error::Concurrency {
            entry,
            aggregate_id,
            sequence_number,
        } => {
            assert_eq!(entry, EntryKind::Event);
            assert_eq!(aggregate_id, "123");
            assert_eq!(sequence_number, 0);
        }
        other => panic!("expected concurrency error, got {other:?}"),
    }
}

#[test]
fn duplicate_event_identifier_raises_concurrency_error() {
    let (conn, store) = common::open_store();

    let first = common::payload_event("a", 0, "x");
    store.append_events(&conn, &[first.clone()]).unwrap();

    // Same identifier on a different stream position.
    let mut clash = common::payload_event("a", 1, "y");
    clash.event_identifier = first.event_identifier;
    let err = store.append_events(&conn, &[clash]).unwrap_err();
    assert!(matches!(err, Error::Concurrency { .. }));
}

#[test]
fn without_translator_the_raw_error_escapes() {
    let conn = common::open_connection();
    let store = EventStore::builder().without_exception_translation().build();

    store
        .append_events(&conn, &[common::payload_event("123", 0, "Mock contents")])
        .unwrap();
    let err = store
        .append_events(&conn, &[common::payload_event("123", 0, "Mock contents")])
        .unwrap_err();

    assert!(
        !matches!(err, Error::Concurrency { .. }),
        "did not expect the error to be translated"
    );
    let message = err.to_string().to_lowercase();
    assert!(message.contains("persist an event"), "message was: {message}");
    assert!(
        message.contains("domain_event_entry"),
        "message should name the entity set: {message}"
    );
}

#[test]
fn disabling_the_resolver_after_construction_works() {
    let (conn, mut store) = common::open_store();
    store.set_persistence_exception_resolver(None);

    store
        .append_events(&conn, &[common::payload_event("123", 0, "x")])
        .unwrap();
    let err = store
        .append_events(&conn, &[common::payload_event("123", 0, "x")])
        .unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
}

#[test]
fn failed_append_stops_at_the_first_failing_event() {
    let (conn, store) = common::open_store();
    store
        .append_events(&conn, &common::stub_events("id", 0, 2))
        .unwrap();

    // Events persist in order inside the caller's transaction; the
    // duplicate in the middle stops the call and the rollback discards
    // what preceded it.
    conn.execute_batch("BEGIN").unwrap();
    let batch = vec![
        common::payload_event("id", 2, "kept-until-rollback"),
        common::payload_event("id", 2, "duplicate"),
        common::payload_event("id", 3, "never-attempted"),
    ];
    let err = store.append_events(&conn, &batch).unwrap_err();
    assert!(matches!(err, Error::Concurrency { .. }));
    conn.execute_batch("ROLLBACK").unwrap();

    assert_eq!(common::count_rows(&conn, "domain_event_entry"), 2);
}

#[test]
fn interleaved_appends_to_distinct_aggregates_do_not_conflict() {
    let (conn, store) = common::open_store();

    for round in 0..5u64 {
        store
            .append_events(&conn, &[common::payload_event("left", round, "l")])
            .unwrap();
        store
            .append_events(&conn, &[common::payload_event("right", round, "r")])
            .unwrap();
    }

    assert_eq!(store.read_events(&conn, "left").unwrap().count(), 5);
    assert_eq!(store.read_events(&conn, "right").unwrap().count(), 5);
}
