use kad_dht::{key_to_id, ContentRoutingTable, PeerInfo, RecordStore};
use tokio::time::Duration;

fn peer(byte: u8) -> PeerInfo {
    let mut id = [0u8; 32];
    id[0] = byte;
    PeerInfo::new(id, vec![format!("node-{byte}")])
}

#[tokio::test(start_paused = true)]
async fn put_then_get_returns_the_value() {
    let mut store = RecordStore::new(64, Duration::from_secs(3600));
    store.put(b"foo".to_vec(), b"bar".to_vec());

    let record = store.get(b"foo").expect("record present");
    assert_eq!(record.key, b"foo".to_vec());
    assert_eq!(record.value, b"bar".to_vec());
    assert!(store.get(b"other").is_none());
}

#[tokio::test(start_paused = true)]
async fn put_overwrites_previous_value() {
    let mut store = RecordStore::new(64, Duration::from_secs(3600));
    store.put(b"foo".to_vec(), b"one".to_vec());
    store.put(b"foo".to_vec(), b"two".to_vec());

    assert_eq!(store.get(b"foo").map(|r| r.value), Some(b"two".to_vec()));
    assert_eq!(store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn expired_records_are_invisible() {
    let mut store = RecordStore::new(64, Duration::from_secs(100));
    store.put(b"foo".to_vec(), b"bar".to_vec());

    tokio::time::advance(Duration::from_secs(99)).await;
    assert!(store.get(b"foo").is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.get(b"foo").is_none());
    // Lazy GC dropped the entry on the failed read.
    assert_eq!(store.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn remote_expiry_is_clamped_to_the_local_ttl() {
    let mut store = RecordStore::new(64, Duration::from_secs(100));
    let far_future = tokio::time::Instant::now() + Duration::from_secs(1_000_000);
    store.put_with_expiry(b"foo".to_vec(), b"bar".to_vec(), far_future);

    tokio::time::advance(Duration::from_secs(101)).await;
    assert!(store.get(b"foo").is_none());
}

#[tokio::test(start_paused = true)]
async fn store_capacity_is_bounded() {
    let mut store = RecordStore::new(2, Duration::from_secs(3600));
    store.put(b"a".to_vec(), b"1".to_vec());
    store.put(b"b".to_vec(), b"2".to_vec());
    store.put(b"c".to_vec(), b"3".to_vec());

    assert_eq!(store.len(), 2);
    // Least recently used entry was evicted.
    assert!(store.get(b"a").is_none());
    assert!(store.get(b"c").is_some());
}

#[tokio::test(start_paused = true)]
async fn providers_expire_after_their_ttl() {
    let mut table = ContentRoutingTable::new(Duration::from_secs(200));
    let content = key_to_id(b"K");
    table.add_provider(content, peer(1));

    tokio::time::advance(Duration::from_secs(199)).await;
    assert_eq!(table.providers(&content, None).len(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(table.providers(&content, None).is_empty());
}

#[tokio::test(start_paused = true)]
async fn reannouncing_refreshes_a_provider() {
    let mut table = ContentRoutingTable::new(Duration::from_secs(100));
    let content = key_to_id(b"K");
    table.add_provider(content, peer(1));

    tokio::time::advance(Duration::from_secs(80)).await;
    table.add_provider(content, peer(1));

    tokio::time::advance(Duration::from_secs(80)).await;
    assert_eq!(table.providers(&content, None).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn provider_limit_is_honored() {
    let mut table = ContentRoutingTable::new(Duration::from_secs(100));
    let content = key_to_id(b"K");
    for byte in 1..=5 {
        table.add_provider(content, peer(byte));
    }

    assert_eq!(table.providers(&content, Some(3)).len(), 3);
    assert_eq!(table.providers(&content, None).len(), 5);
}
