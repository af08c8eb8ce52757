//! Exercises the embeddable surface without touching the network.  The
//! engine is constructed but never started, so these contracts hold with no
//! sockets, no peers, and no background tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mccache::{CacheError, ChangeKind, McCache, McCacheConfig};

fn engine() -> McCache {
    let mut config = McCacheConfig::default();
    config.cache_ttl = 0;
    McCache::new(config).expect("engine construction is offline")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    logins: u32,
}

#[test]
fn typed_round_trip() {
    let node = engine();
    let cache = node.get_cache::<String, Session>("sessions");
    let session = Session {
        user: "ada".to_string(),
        logins: 3,
    };
    cache.set(&"s1".to_string(), &session).unwrap();
    assert_eq!(cache.get(&"s1".to_string()).unwrap(), session);
    assert!(cache.contains(&"s1".to_string()).unwrap());
    assert_eq!(cache.len(), 1);
}

#[test]
fn missing_keys_fail_with_key_missing() {
    let node = engine();
    let cache = node.get_cache::<String, String>("misses");
    assert!(matches!(
        cache.get(&"nope".to_string()),
        Err(CacheError::KeyMissing { .. })
    ));
    assert!(matches!(
        cache.delete(&"nope".to_string()),
        Err(CacheError::KeyMissing { .. })
    ));
    let metrics = cache.metrics();
    assert_eq!(metrics.misses, 1);
}

#[test]
fn handles_over_one_name_share_one_store() {
    let node = engine();
    let a = node.get_cache::<String, u64>("shared");
    let b = node.get_cache::<String, u64>("shared");
    a.set(&"k".to_string(), &7).unwrap();
    assert_eq!(b.get(&"k".to_string()).unwrap(), 7);

    let other = node.get_cache::<String, u64>("elsewhere");
    assert!(other.get(&"k".to_string()).is_err());
}

#[test]
fn empty_name_selects_the_default_namespace() {
    let node = engine();
    let unnamed = node.get_cache::<String, u32>("");
    let named = node.get_cache::<String, u32>(mccache::DEFAULT_NAMESPACE);
    unnamed.set(&"k".to_string(), &1).unwrap();
    assert_eq!(named.get(&"k".to_string()).unwrap(), 1);
}

#[test]
fn entry_budget_is_never_exceeded() {
    let mut config = McCacheConfig::default();
    config.cache_ttl = 0;
    config.cache_max = 8;
    let node = McCache::new(config).unwrap();
    let cache = node.get_cache::<u32, u32>("bounded");
    for i in 0..50u32 {
        cache.set(&i, &i).unwrap();
        assert!(cache.len() <= 8);
    }
    let metrics = cache.metrics();
    assert_eq!(metrics.inserts, 50);
    assert_eq!(metrics.evicts, 42);
    // The survivors are the most recently inserted keys.
    assert_eq!(cache.get(&49).unwrap(), 49);
    assert!(cache.get(&0).is_err());
}

#[test]
fn oversize_values_are_rejected_without_side_effects() {
    let mut config = McCacheConfig::default();
    config.cache_ttl = 0;
    config.cache_size = 256;
    let node = McCache::new(config).unwrap();
    let cache = node.get_cache::<String, Vec<u8>>("tight");
    let err = cache
        .set(&"big".to_string(), &vec![0u8; 1024])
        .unwrap_err();
    assert!(matches!(err, CacheError::ValueTooLarge { .. }));
    assert!(cache.is_empty());
}

#[test]
fn expired_entries_vanish_and_each_expiry_is_counted_once() {
    let mut config = McCacheConfig::default();
    config.cache_ttl = 1;
    let node = McCache::new(config).unwrap();
    let cache = node.get_cache::<String, String>("ttl");
    cache.set(&"k".to_string(), &"v".to_string()).unwrap();

    std::thread::sleep(Duration::from_millis(1100));
    assert!(matches!(
        cache.get(&"k".to_string()),
        Err(CacheError::KeyMissing { .. })
    ));
    // Repeated lookups stay misses without new evictions.
    assert!(cache.get(&"k".to_string()).is_err());
    let metrics = cache.metrics();
    assert_eq!(metrics.evicts, 1);
    assert_eq!(metrics.misses, 2);
}

#[test]
fn pop_is_local_and_returns_the_value() {
    let node = engine();
    let cache = node.get_cache::<String, String>("pops");
    cache.set(&"k".to_string(), &"v".to_string()).unwrap();
    assert_eq!(cache.pop(&"k".to_string()).unwrap(), Some("v".to_string()));
    assert_eq!(cache.pop(&"k".to_string()).unwrap(), None);
    assert!(cache.is_empty());
}

#[test]
fn keys_come_back_typed_and_in_insertion_order() {
    let node = engine();
    let cache = node.get_cache::<String, u32>("ordered");
    for name in ["alpha", "beta", "gamma"] {
        cache.set(&name.to_string(), &1).unwrap();
    }
    assert_eq!(
        cache.keys(),
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()]
    );
}

#[test]
fn clear_cache_resets_the_named_namespace_everywhere_locally() {
    let node = engine();
    let users = node.get_cache::<String, u32>("users");
    let orders = node.get_cache::<String, u32>("orders");
    users.set(&"u".to_string(), &1).unwrap();
    orders.set(&"o".to_string(), &2).unwrap();

    node.clear_cache(Some("users"));
    assert!(users.is_empty());
    assert_eq!(orders.len(), 1);

    node.clear_cache(None);
    assert!(orders.is_empty());
}

#[test]
fn callback_registration_survives_handle_reuse() {
    let node = engine();
    let fired = Arc::new(AtomicUsize::new(0));
    let sink = fired.clone();
    let cache = node.get_cache_with_callback::<String, String>(
        "watched",
        Arc::new(move |event| {
            assert_eq!(event.kind, ChangeKind::Update);
            sink.fetch_add(1, Ordering::SeqCst);
        }),
    );
    cache.set(&"k".to_string(), &"v1".to_string()).unwrap();
    let _ = cache.get(&"k".to_string());

    // A later handle over the same namespace sees the same callback.
    let again = node.get_cache::<String, String>("watched");
    again.set(&"k".to_string(), &"v2".to_string()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn metrics_reflect_traffic() {
    let node = engine();
    let cache = node.get_cache::<String, String>("counted");
    cache.set(&"a".to_string(), &"1".to_string()).unwrap();
    cache.set(&"a".to_string(), &"2".to_string()).unwrap();
    cache.set(&"b".to_string(), &"3".to_string()).unwrap();
    let _ = cache.get(&"a".to_string());
    let _ = cache.get(&"zzz".to_string());
    cache.delete(&"b".to_string()).unwrap();

    let metrics = cache.metrics();
    assert_eq!(metrics.inserts, 2);
    assert_eq!(metrics.updates, 1);
    assert_eq!(metrics.deletes, 1);
    assert_eq!(metrics.lookups, 2);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.entry_count, 1);
    assert!(metrics.total_bytes > 0);
    assert!(metrics.spikes > 0);
}

#[test]
fn members_start_empty_and_cluster_queries_do_not_require_a_network() {
    let node = engine();
    assert!(node.members().is_empty());
    // These only enqueue work; with no peers and no started workers they
    // must still be safe to call.
    node.get_cluster_metrics(None);
    node.get_cache_checksum::<String>(Some("anything"), None, None);
}
