mod common;

use annal::Error;

// SQLite refuses to drop a table while any statement over it is still
// open, so a successful DROP proves every statement and result set from
// the preceding reads was released.

#[test]
fn failed_lookup_releases_all_statements() {
    let (conn, store) = common::open_store();
    store
        .append_events(&conn, &common::stub_events("exists", 0, 3))
        .unwrap();

    let err = store.read_events(&conn, "noSuchId").unwrap_err();
    assert!(matches!(err, Error::StreamNotFound { .. }));

    conn.execute_batch("DROP TABLE domain_event_entry")
        .expect("no statement may remain open after a failed read");
}

#[test]
fn abandoned_stream_releases_all_statements() {
    let (conn, store) = common::open_store();
    store
        .append_events(&conn, &common::stub_events("id", 0, 150))
        .unwrap();

    {
        let mut stream = store.read_events(&conn, "id").unwrap();
        // Consume one element out of the first batch, then abort.
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.sequence_number, 0);
    }

    conn.execute_batch("DROP TABLE domain_event_entry")
        .expect("no statement may remain open after dropping a stream mid-batch");
}

#[test]
fn exhausted_visit_releases_all_statements() {
    let (conn, store) = common::open_store();
    store
        .append_events(&conn, &common::stub_events("id", 0, 5))
        .unwrap();

    let mut count = 0usize;
    store
        .visit_events(&conn, &mut |_: &annal::StoredEvent| count += 1)
        .unwrap();
    assert_eq!(count, 5);

    conn.execute_batch("DROP TABLE domain_event_entry")
        .expect("no statement may remain open after a completed visit");
}
