// ABOUTME: End-to-end smoke test for the full logspool lifecycle.
// ABOUTME: Tests append, batch drain, acknowledgment, restart recovery, eviction, and group purge on disk.

use std::sync::Arc;

use logspool_core::{
    AppProperty, CommonSchemaEnvelope, JsonLogSerializer, LogRecord, PlainLogFactory,
};
use logspool_store::{LOGS_TABLE, Persistence, RowStore, StoreConfig};

fn open(config: &StoreConfig) -> Persistence {
    let serializer = JsonLogSerializer::with_common_schema().with_fallback(PlainLogFactory);
    Persistence::open(config.clone(), Arc::new(serializer)).unwrap()
}

#[test]
fn smoke_test_full_lifecycle() {
    // 1. Fresh store in a temp home
    let dir = tempfile::TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path().to_path_buf())
        .with_capacity(20)
        .with_inline_threshold(2048);
    let persistence = open(&config);
    assert!(persistence.groups().unwrap().is_empty());

    // 2. Append plain, large, and common schema logs to two groups
    let plain: Vec<_> = (0..5)
        .map(|i| LogRecord::new("startService").with_property("seq", i.to_string()))
        .collect();
    for log in &plain {
        persistence.append("analytics", log).unwrap();
    }

    let large = LogRecord::new("crash").with_property("stack", "frame\n".repeat(1000));
    let large_id = persistence.append("crashes", &large).unwrap();
    assert!(config.payload_root().exists(), "large log should be offloaded");

    let mut envelope = CommonSchemaEnvelope::new("pageView");
    envelope.set(AppProperty::Name, Some("demo".to_string()));
    envelope.set(AppProperty::Version, Some("1.2.3".to_string()));
    let tracked = LogRecord::common_schema(envelope, "tenant-token");
    persistence.append("analytics", &tracked).unwrap();

    assert_eq!(persistence.count("analytics").unwrap(), 6);
    assert_eq!(persistence.count("crashes").unwrap(), 1);
    assert_eq!(persistence.groups().unwrap(), vec!["analytics", "crashes"]);

    // 3. Drain in two batches; the second picks up where the first stopped
    let first = persistence.drain("analytics", 4).unwrap().expect("first batch");
    assert_eq!(first.logs, plain[..4].to_vec());
    let second = persistence.drain("analytics", 4).unwrap().expect("second batch");
    assert_eq!(second.logs, vec![plain[4].clone(), tracked.clone()]);
    assert!(persistence.drain("analytics", 4).unwrap().is_none());

    // 4. Acknowledge the first batch only
    persistence.acknowledge("analytics", &first.id).unwrap();
    assert_eq!(persistence.count("analytics").unwrap(), 2);

    // 5. The token is encrypted at rest
    persistence.close().unwrap();
    let rows = RowStore::open(&config.database_path(), LOGS_TABLE).unwrap();
    let mut stored_tokens = Vec::new();
    rows.scan(None, logspool_store::Order::Ascending, |row| {
        if let Some(token) = row.get("target_token") {
            stored_tokens.push(token.to_string());
        }
        std::ops::ControlFlow::Continue(())
    })
    .unwrap();
    rows.close().unwrap();
    assert_eq!(stored_tokens.len(), 1);
    assert!(!stored_tokens[0].contains("tenant-token"));

    // 6. After a restart the unacknowledged batch is drainable again
    let persistence = open(&config);
    let replay = persistence.drain("analytics", 10).unwrap().expect("replayed batch");
    assert_eq!(replay.logs, second.logs);
    assert_eq!(replay.logs[1].target_token.as_deref(), Some("tenant-token"));

    let crash = persistence.drain("crashes", 10).unwrap().expect("large log");
    assert_eq!(crash.logs, vec![large]);

    // 7. Purging a group removes its rows and payload files
    persistence.delete_group("crashes").unwrap();
    assert_eq!(persistence.count("crashes").unwrap(), 0);
    assert!(
        !config
            .payload_root()
            .join("crashes")
            .join(format!("{large_id}.json"))
            .exists()
    );

    // 8. Capacity holds across groups
    for i in 0..30 {
        persistence
            .append("burst", &LogRecord::new("tick").with_property("i", i.to_string()))
            .unwrap();
    }
    assert_eq!(persistence.total_count().unwrap(), 20);
    assert_eq!(persistence.count("analytics").unwrap(), 0);

    persistence.close().unwrap();
}
