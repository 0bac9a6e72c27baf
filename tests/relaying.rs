//! Locality-aware relay tests.

use observatory::dispatch::RelaySelector;
use observatory::{
    CoreConfig, CoreError, Endpoint, EntityId, EventFilter, EventHandle, LocalCluster, MemoryStore,
    Message, ObserverEvent, SeededRandom,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> CoreConfig {
    CoreConfig {
        max_retry_count: 2,
        backoff_delay: Duration::ZERO,
        ..CoreConfig::default()
    }
}

fn feed_id() -> EntityId {
    EntityId::service("fabric:/app/Feed", Some(1))
        .unwrap()
        .with_node("n0")
}

fn watcher_id(key: &str, node: &str) -> EntityId {
    EntityId::actor("fabric:/app/Watchers", key)
        .unwrap()
        .with_node(node)
}

struct Watcher {
    id: EntityId,
    endpoint: Endpoint,
    events: EventHandle,
}

impl Watcher {
    fn received(&self) -> usize {
        self.events
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ObserverEvent::MessageReceived { .. }))
            .count()
    }
}

/// Three watchers on n1 (`a`, `b`, `c`) and one on n2 (`d`), all unfiltered.
async fn setup(cluster: &LocalCluster, feed: &Endpoint) -> Vec<Watcher> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    feed.register_observable("prices").await.unwrap();

    let mut watchers = Vec::new();
    for (key, node) in [("a", "n1"), ("b", "n1"), ("c", "n1"), ("d", "n2")] {
        let id = watcher_id(key, node);
        let endpoint = cluster.spawn(id.clone()).unwrap();
        endpoint
            .register_observer("prices", vec![], &feed_id())
            .await
            .unwrap();
        let events = endpoint.events().subscribe(EventFilter::all());
        watchers.push(Watcher {
            id,
            endpoint,
            events,
        });
    }
    watchers
}

#[tokio::test]
async fn test_one_call_per_node() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    let watchers = setup(&cluster, &feed).await;

    let report = feed
        .notify_observers("prices", Message::new("tick"), true)
        .await
        .unwrap();

    // The feed only called the first member of each node group.
    assert_eq!(report.delivered, vec![watchers[0].id.clone(), watchers[3].id.clone()]);
    for watcher in &watchers {
        assert_eq!(watcher.received(), 1, "{} missed the message", watcher.id);
    }
}

#[tokio::test]
async fn test_direct_mode_calls_everyone() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    let watchers = setup(&cluster, &feed).await;

    let report = feed
        .notify_observers("prices", Message::new("tick"), false)
        .await
        .unwrap();

    assert_eq!(report.delivered.len(), 4);
    for watcher in &watchers {
        assert_eq!(watcher.received(), 1);
    }
}

#[tokio::test]
async fn test_unreachable_relay_is_mailboxed_and_group_rerouted() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    let watchers = setup(&cluster, &feed).await;
    cluster.transport().set_unreachable(&watchers[0].id, true);

    let report = feed
        .notify_observers("prices", Message::new("tick"), true)
        .await
        .unwrap();

    assert_eq!(report.mailboxed, vec![watchers[0].id.clone()]);
    assert_eq!(report.delivered, vec![watchers[1].id.clone(), watchers[3].id.clone()]);

    assert_eq!(watchers[0].received(), 0);
    for watcher in &watchers[1..] {
        assert_eq!(watcher.received(), 1);
    }
    assert_eq!(
        watchers[0].endpoint.read_mailbox().await.unwrap(),
        vec![Message::new("tick")]
    );
}

#[tokio::test]
async fn test_relay_mailboxes_its_unreachable_peers() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    let watchers = setup(&cluster, &feed).await;
    cluster.transport().set_unreachable(&watchers[2].id, true);

    let report = feed
        .notify_observers("prices", Message::new("tick"), true)
        .await
        .unwrap();

    // The feed's own calls all succeeded; the relay dealt with `c`.
    assert!(report.is_clean());
    assert!(report.mailboxed.is_empty());
    assert_eq!(watchers[2].received(), 0);
    assert_eq!(
        watchers[2].endpoint.read_mailbox().await.unwrap(),
        vec![Message::new("tick")]
    );
    assert!(watchers[0].endpoint.read_mailbox().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_seeded_relay_choice_is_reproducible() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster
        .spawn_with(
            feed_id(),
            Arc::new(MemoryStore::new()),
            Some(Arc::new(SeededRandom::new(99))),
        )
        .unwrap();
    let watchers = setup(&cluster, &feed).await;

    let report = feed
        .notify_observers("prices", Message::new("tick"), true)
        .await
        .unwrap();

    let n1: Vec<EntityId> = watchers[..3].iter().map(|w| w.id.clone()).collect();
    let expected = SeededRandom::new(99).pick(&n1);
    assert_eq!(report.delivered[0], n1[expected]);
    assert_eq!(report.delivered[1], watchers[3].id);
    for watcher in &watchers {
        assert_eq!(watcher.received(), 1);
    }
}

#[tokio::test]
async fn test_unregister_notice_relayed() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    let watchers = setup(&cluster, &feed).await;

    let report = feed.unregister_observable("prices", true).await.unwrap();
    assert_eq!(report.delivered.len(), 2);

    for watcher in &watchers {
        assert!(watcher.endpoint.subscriptions().await.unwrap().is_empty());
        assert!(watcher
            .events
            .drain()
            .iter()
            .any(|e| matches!(e, ObserverEvent::ObservableUnregistered { .. })));
    }
}

#[tokio::test]
async fn test_failed_relay_teardown_not_forwarded_twice() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    feed.register_observable("prices").await.unwrap();

    let relay_store = MemoryStore::new();
    let relay = cluster
        .spawn_with(watcher_id("a", "n1"), Arc::new(relay_store.clone()), None)
        .unwrap();
    let peer = cluster.spawn(watcher_id("b", "n1")).unwrap();
    for endpoint in [&relay, &peer] {
        endpoint
            .register_observer("prices", vec![], &feed_id())
            .await
            .unwrap();
    }
    let peer_events = peer.events().subscribe(EventFilter::all());

    // The relay cannot commit, so it cannot forget the feed.
    relay_store.fail_next_commits(100);
    let err = feed.unregister_observable("prices", true).await.unwrap_err();
    assert!(matches!(err, CoreError::Delivery(ref f) if f.len() == 1));

    // The peer heard about it once, through the feed's re-plan.
    let notices = peer_events
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ObserverEvent::ObservableUnregistered { .. }))
        .count();
    assert_eq!(notices, 1);
    assert!(peer.subscriptions().await.unwrap().is_empty());
    assert_eq!(relay.subscriptions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_filtered_targets_grouped_after_selection() {
    let cluster = LocalCluster::new(test_config()).unwrap();
    let feed = cluster.spawn(feed_id()).unwrap();
    feed.register_observable("prices").await.unwrap();

    let mut handles = Vec::new();
    for (key, node, filter) in [
        ("a", "n1", "id = 2"),
        ("b", "n1", "id = 1"),
        ("c", "n1", "id = 1"),
    ] {
        let endpoint = cluster.spawn(watcher_id(key, node)).unwrap();
        endpoint
            .register_observer("prices", vec![filter.to_string()], &feed_id())
            .await
            .unwrap();
        handles.push(endpoint.events().subscribe(EventFilter::all()));
    }

    let report = feed
        .notify_observers("prices", Message::new(r#"{"id":1}"#), true)
        .await
        .unwrap();

    // `a` is filtered out, so `b` relays for `c`.
    assert_eq!(report.delivered, vec![watcher_id("b", "n1")]);
    assert!(handles[0].drain().is_empty());
    assert_eq!(handles[1].drain().len(), 1);
    assert_eq!(handles[2].drain().len(), 1);
}
