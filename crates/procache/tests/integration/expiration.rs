use std::time::Duration;

use procache::{BackingStore, EventReason};

use crate::{Fixture, START, config, test};

#[tokio::test]
async fn test_expired_hook_reports_once() {
    let mut cfg = config(2, 0);
    cfg.expiration_scan_interval = Duration::from_secs(1);
    // far fewer slots than keys expiring in one sweep
    cfg.hook_queue_size = 4;
    let fixture = &Fixture::new(cfg);

    let keys: Vec<u32> = (1..=40).collect();
    for &key in &keys {
        fixture.get(key).await;
    }

    // all keys expire, the next insertion crosses the scan watermark
    fixture.advance(2);
    fixture.get(100).await;
    let keys = &keys;
    test::eventually(|| async move {
        let mut expired = fixture.events(EventReason::Expired);
        expired.sort();
        expired == *keys
    })
    .await;
    assert_eq!(fixture.store.len(), 1);

    // key 100 is not due yet, and the others are not reported again
    fixture.advance(1);
    fixture.get(101).await;
    fixture.store.sweep();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.events(EventReason::Expired).len(), keys.len());

    fixture.advance(1);
    fixture.store.sweep();
    test::eventually(|| async move {
        fixture.events(EventReason::Expired).len() == keys.len() + 1
    })
    .await;
    assert_eq!(fixture.events(EventReason::Expired).last(), Some(&100));
}

#[tokio::test]
async fn test_store_entries() {
    let fixture = Fixture::new(config(5, 0));

    fixture.get(1).await;
    let entry = fixture.store.try_get(&1).unwrap();
    assert!(entry.is_resolved());
    assert_eq!(entry.value().unwrap().version, 1);
    assert_eq!(entry.stale_at(), START);

    fixture.advance(5);
    assert!(fixture.store.try_get(&1).is_none());
    // a lookup after expiration recomputes the value
    assert_eq!(fixture.get(1).await.version, 2);
}
