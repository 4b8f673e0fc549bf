//! Bridge side: recording inbound packets and the run loop.

mod common;

use std::sync::Arc;

use meshllm::bridge::{Bridge, InboundOutcome, SightingOutcome, NODES_SCHEMA, SIGHTINGS_SCHEMA};
use meshllm::meshtastic::{ConsoleTransport, InboundText, Packet, Telemetry};
use meshllm::storage::RecordStore;
use meshllm::thread::{has_reply, Direction, MessageRecord, Meta, NodeLayout, ThreadLog, ThreadType};
use tempfile::tempdir;

use common::{test_config, thread_path, NODE};

fn packet(id: Option<&str>, text: &str) -> InboundText {
    InboundText {
        message_id: id.map(str::to_string),
        from: "!a1b2c3d4".into(),
        to: None,
        channel_index: 1,
        channel_name: Some("LongFast".into()),
        text: text.into(),
        short_name: Some("AB".into()),
        long_name: Some("Alpha Bravo".into()),
        timestamp: Some("2025-05-01T10:00:00.000000+00:00".into()),
        reply_to_id: None,
    }
}

fn report(timestamp: &str, rssi: i32) -> Telemetry {
    let mut payload = Meta::new();
    payload.insert("battery_level", 87);
    payload.insert("voltage", 4.1);
    Telemetry {
        from: "!a1b2c3d4".into(),
        latitude: Some(39.7392),
        longitude: Some(-104.9903),
        rssi: Some(rssi),
        payload,
        short_name: Some("AB".into()),
        long_name: None,
        timestamp: Some(timestamp.into()),
    }
}

#[test]
fn test_record_inbound_writes_row_and_node() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());
    bridge.ensure_node_paths().unwrap();

    let outcome = bridge.record_inbound(&packet(Some("3001"), "librarian status")).unwrap();
    let path = thread_path(&config, ThreadType::Channel, "LongFast");
    assert_eq!(
        outcome,
        InboundOutcome::Recorded {
            path: path.clone(),
            message_id: "3001".into()
        }
    );

    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let rows = log.read_all(&path).unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.direction, Direction::Inbound);
    assert_eq!(row.thread_key, "LongFast");
    assert_eq!(row.sender_id, "!a1b2c3d4");
    assert!(!row.processed);
    assert_eq!(row.meta.channel_index(), Some(1));
    assert_eq!(row.meta.get_str("channel_name"), Some("LongFast"));

    let store = RecordStore::new(config.lock.options());
    let nodes = store.read(&bridge.node_dir().join("nodes.csv")).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["short_name"], "AB");
    assert_eq!(nodes[0]["long_name"], "Alpha Bravo");
    assert_eq!(NODES_SCHEMA.len(), nodes[0].len());
}

#[test]
fn test_duplicates_are_skipped() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());

    bridge.record_inbound(&packet(Some("1"), "hi")).unwrap();
    // same packet id
    let again = bridge.record_inbound(&packet(Some("1"), "hi")).unwrap();
    assert!(matches!(again, InboundOutcome::Duplicate { .. }));
    // no id, but same sender/timestamp/content
    let again = bridge.record_inbound(&packet(None, "hi")).unwrap();
    assert!(matches!(again, InboundOutcome::Duplicate { .. }));
    // new content is recorded with a generated id
    match bridge.record_inbound(&packet(None, "hello")).unwrap() {
        InboundOutcome::Recorded { message_id, .. } => assert_eq!(message_id.len(), 36),
        other => panic!("unexpected {:?}", other),
    }

    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let rows = log.read_all(&thread_path(&config, ThreadType::Channel, "LongFast")).unwrap();
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_direct_messages_go_to_dm_thread() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());
    let mut p = packet(Some("9"), "secret");
    p.to = Some("!0000beef".into());
    bridge.record_inbound(&p).unwrap();

    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let rows = log.read_all(&thread_path(&config, ThreadType::Dm, "!a1b2c3d4")).unwrap();
    assert_eq!(rows[0].thread_type, Some(ThreadType::Dm));
    assert_eq!(rows[0].thread_key, "!a1b2c3d4");
}

#[tokio::test]
async fn test_run_records_packets_and_flushes_replies() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let path = thread_path(&config, ThreadType::Channel, "LongFast");
    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let mut reply = MessageRecord::new(ThreadType::Channel, "LongFast", Direction::Queued);
    reply.message_id = "r1".into();
    reply.content = "answer".into();
    log.append(&path, &reply).unwrap();

    let bridge = Bridge::new(&config, ConsoleTransport::new());
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tx.send(Packet::Text(packet(Some("77"), "librarian hello"))).unwrap();
    tx.send(report("2025-05-01T10:00:05+00:00", -90).into()).unwrap();
    bridge.run(rx, true).await.unwrap();

    let rows = log.read_all(&path).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].direction, Direction::Outbound);
    assert_eq!(rows[1].message_id, "77");

    let store = RecordStore::new(config.lock.options());
    let sightings = store
        .read(&NodeLayout::new(config.nodes_base()).sightings_log(NODE))
        .unwrap();
    assert_eq!(sightings.len(), 1);
}

#[test]
fn test_reply_id_is_carried_without_hiding_the_message() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());
    let mut p = packet(Some("3002"), "librarian and why?");
    p.reply_to_id = Some(" 3001 ".into());
    bridge.record_inbound(&p).unwrap();

    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let rows = log.read_all(&thread_path(&config, ThreadType::Channel, "LongFast")).unwrap();
    assert_eq!(rows[0].reply_to_id.as_deref(), Some("3001"));
    assert!(!has_reply(&rows, "3001"));
}

#[test]
fn test_concurrent_recording_keeps_one_row() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Arc::new(Bridge::new(&config, ConsoleTransport::new()));
    bridge.ensure_node_paths().unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || bridge.record_inbound(&packet(Some("4242"), "same packet, many radios")).unwrap())
        })
        .collect();
    let recorded = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|o| matches!(o, InboundOutcome::Recorded { .. }))
        .count();
    assert_eq!(recorded, 1);

    let log = ThreadLog::new(RecordStore::new(config.lock.options()));
    let rows = log.read_all(&thread_path(&config, ThreadType::Channel, "LongFast")).unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn test_sighting_written_and_node_registered() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());
    bridge.ensure_node_paths().unwrap();

    let outcome = bridge.record_sighting(&report("2025-05-01T10:00:00+00:00", -97)).unwrap();
    let hash = match outcome {
        SightingOutcome::Recorded { sighting_hash } => sighting_hash,
        other => panic!("unexpected {:?}", other),
    };
    // UUIDv5 text form
    assert_eq!(hash.len(), 36);
    assert_eq!(&hash[14..15], "5");

    let store = RecordStore::new(config.lock.options());
    let rows = store.read(&bridge.node_dir().join("sightings.csv")).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].len(), SIGHTINGS_SCHEMA.len());
    assert_eq!(rows[0]["node_id"], "!a1b2c3d4");
    assert_eq!(rows[0]["rssi"], "-97");
    assert_eq!(rows[0]["latitude"], "39.7392");
    assert_eq!(rows[0]["sighting_hash"], hash);
    let telemetry = Meta::parse(&rows[0]["telemetry_json"]).unwrap();
    assert_eq!(telemetry.get_i64("battery_level"), Some(87));

    let nodes = store.read(&bridge.node_dir().join("nodes.csv")).unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0]["short_name"], "AB");
}

#[test]
fn test_sightings_dedupe_per_node_per_day() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());

    let first = bridge.record_sighting(&report("2025-05-01T08:00:00+00:00", -97)).unwrap();
    // identical readings later the same day
    let same_day = bridge.record_sighting(&report("2025-05-01T21:30:00+00:00", -97)).unwrap();
    assert!(matches!(same_day, SightingOutcome::Duplicate { .. }));
    // identical readings the next day
    let next_day = bridge.record_sighting(&report("2025-05-02T08:00:00+00:00", -97)).unwrap();
    match (&first, &next_day) {
        (SightingOutcome::Recorded { sighting_hash: a }, SightingOutcome::Recorded { sighting_hash: b }) => assert_eq!(a, b),
        other => panic!("unexpected {:?}", other),
    }
    // different signal the same day
    let moved = bridge.record_sighting(&report("2025-05-01T09:00:00+00:00", -60)).unwrap();
    assert!(matches!(moved, SightingOutcome::Recorded { .. }));
    assert_ne!(moved, first);

    // another node with the same readings is its own sighting
    let mut other = report("2025-05-01T08:00:00+00:00", -97);
    other.from = "!0000beef".into();
    assert!(matches!(bridge.record_sighting(&other).unwrap(), SightingOutcome::Recorded { .. }));

    let store = RecordStore::new(config.lock.options());
    let rows = store.read(&bridge.node_dir().join("sightings.csv")).unwrap();
    assert_eq!(rows.len(), 4);
}

#[test]
fn test_upsert_keeps_first_seen() {
    let tmp = tempdir().unwrap();
    let config = test_config(tmp.path());
    let bridge = Bridge::new(&config, ConsoleTransport::new());
    bridge.upsert_node("!n1", Some("N1"), None).unwrap();
    let store = RecordStore::new(config.lock.options());
    let path = bridge.node_dir().join("nodes.csv");
    let first = store.read(&path).unwrap()[0]["first_seen_at"].clone();

    std::thread::sleep(std::time::Duration::from_millis(5));
    bridge.upsert_node("!n1", None, Some("Node One")).unwrap();
    let rows = store.read(&path).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["first_seen_at"], first);
    assert_eq!(rows[0]["short_name"], "N1");
    assert_eq!(rows[0]["long_name"], "Node One");
    assert_ne!(rows[0]["last_seen_at"], first);
}
