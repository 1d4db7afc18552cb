mod common;

use std::time::Duration;

use cachet::CacheProvider;
use common::{eventually, start, unreachable_config};
use tokio::sync::mpsc;

type Received = mpsc::UnboundedReceiver<(String, Vec<u8>)>;

fn recorder() -> (impl Fn(&str, &[u8]) + Send + Sync + 'static, Received) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |channel: &str, payload: &[u8]| {
        let _ = tx.send((channel.to_string(), payload.to_vec()));
    };
    (handler, rx)
}

async fn next(rx: &mut Received) -> Option<(String, Vec<u8>)> {
    tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn delivers_only_between_subscribe_and_unsubscribe() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (handler, mut rx) = recorder();

    assert_eq!(cache.publish("X", "before").await.unwrap(), 0);
    assert!(cache.subscribe("X", handler).await.unwrap());
    assert_eq!(cache.publish("X", "during").await.unwrap(), 1);
    assert_eq!(next(&mut rx).await, Some(("X".to_string(), b"during".to_vec())));

    cache.unsubscribe("X").await.unwrap();
    assert_eq!(cache.publish("X", "after").await.unwrap(), 0);
    assert_eq!(next(&mut rx).await, None);
}

#[tokio::test]
async fn exact_and_pattern_handlers_both_fire() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (exact, mut exact_rx) = recorder();
    let (pattern, mut pattern_rx) = recorder();

    assert!(cache.subscribe("news.sport", exact).await.unwrap());
    assert!(cache.subscribe_pattern("news.*", pattern).await.unwrap());
    assert_eq!(cache.publish("news.sport", "goal").await.unwrap(), 2);
    assert_eq!(cache.publish("news.weather", "rain").await.unwrap(), 1);

    assert_eq!(next(&mut exact_rx).await, Some(("news.sport".to_string(), b"goal".to_vec())));
    assert_eq!(next(&mut pattern_rx).await, Some(("news.sport".to_string(), b"goal".to_vec())));
    assert_eq!(next(&mut pattern_rx).await, Some(("news.weather".to_string(), b"rain".to_vec())));
    assert_eq!(next(&mut exact_rx).await, None);
}

#[tokio::test]
async fn every_handler_on_a_channel_fires_and_unsubscribe_removes_all() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (first, mut first_rx) = recorder();
    let (second, mut second_rx) = recorder();

    assert!(cache.subscribe("shared", first).await.unwrap());
    assert!(cache.subscribe("shared", second).await.unwrap());
    assert_eq!(cache.notifications().subscription_count(), 1);
    assert_eq!(cache.publish("shared", "hello").await.unwrap(), 1);
    assert!(next(&mut first_rx).await.is_some());
    assert!(next(&mut second_rx).await.is_some());

    cache.unsubscribe("shared").await.unwrap();
    assert_eq!(cache.notifications().subscription_count(), 0);
    cache.publish("shared", "again").await.unwrap();
    assert_eq!(next(&mut first_rx).await, None);
    assert_eq!(next(&mut second_rx).await, None);
}

#[tokio::test]
async fn payloads_are_raw_bytes() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (handler, mut rx) = recorder();

    cache.subscribe("bin", handler).await.unwrap();
    cache.publish("bin", [0u8, 255, 10, 13]).await.unwrap();
    assert_eq!(next(&mut rx).await, Some(("bin".to_string(), vec![0, 255, 10, 13])));
}

#[tokio::test]
async fn messages_cross_providers() {
    let (_server, config) = start().await;
    let listener = CacheProvider::json(config.clone());
    let speaker = CacheProvider::json(config);
    let (handler, mut rx) = recorder();

    listener.subscribe_pattern("jobs.?", handler).await.unwrap();
    assert_eq!(speaker.publish("jobs.1", "run").await.unwrap(), 1);
    assert_eq!(speaker.publish("jobs.10", "skip").await.unwrap(), 0);
    assert_eq!(next(&mut rx).await, Some(("jobs.1".to_string(), b"run".to_vec())));
    assert_eq!(next(&mut rx).await, None);
}

#[tokio::test]
async fn subscriptions_are_restored_after_reconnect() {
    let (server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (old, mut old_rx) = recorder();
    let (new, mut new_rx) = recorder();

    cache.subscribe("old", old).await.unwrap();
    cache.publish("old", "1").await.unwrap();
    assert!(next(&mut old_rx).await.is_some());

    server.drop_connections();
    let watched = &cache;
    assert!(eventually(move || async move { !watched.is_connected() }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(cache.subscribe("new", new).await.unwrap());
    assert_eq!(cache.publish("old", "2").await.unwrap(), 1);
    assert_eq!(cache.publish("new", "3").await.unwrap(), 1);
    assert_eq!(next(&mut old_rx).await, Some(("old".to_string(), b"2".to_vec())));
    assert_eq!(next(&mut new_rx).await, Some(("new".to_string(), b"3".to_vec())));
}

#[tokio::test]
async fn unavailable_store_registers_nothing() {
    let cache = CacheProvider::json(unreachable_config());
    let (handler, _rx) = recorder();

    assert!(!cache.subscribe("X", handler).await.unwrap());
    assert_eq!(cache.notifications().subscription_count(), 0);
    assert_eq!(cache.publish("X", "lost").await.unwrap(), 0);
    cache.unsubscribe("X").await.unwrap();
}

#[tokio::test]
async fn closing_the_provider_stops_delivery() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config.clone());
    let other = CacheProvider::json(config);
    let (handler, mut rx) = recorder();

    cache.subscribe("bye", handler).await.unwrap();
    cache.close();
    assert_eq!(cache.notifications().subscription_count(), 0);
    let other = &other;
    assert!(eventually(move || async move { other.publish("bye", "late").await.unwrap() == 0 }).await);
    assert_eq!(next(&mut rx).await, None);
}

#[tokio::test]
async fn concurrent_subscribe_and_unsubscribe_stay_consistent() {
    let (_server, config) = start().await;
    let cache = CacheProvider::json(config);
    let (warmup, _warmup_rx) = recorder();
    cache.subscribe("warmup", warmup).await.unwrap();

    for round in 0..20 {
        let (handler, _rx) = recorder();
        if round % 2 == 0 {
            let (subscribed, unsubscribed) =
                tokio::join!(cache.subscribe("race", handler), cache.unsubscribe("race"));
            subscribed.unwrap();
            unsubscribed.unwrap();
        } else {
            let (unsubscribed, subscribed) =
                tokio::join!(cache.unsubscribe("race"), cache.subscribe("race", handler));
            subscribed.unwrap();
            unsubscribed.unwrap();
        }

        let registered = cache.notifications().subscription_count() == 2;
        let receivers = cache.publish("race", "ping").await.unwrap();
        assert_eq!(receivers, u64::from(registered), "round {round}");
    }
}
