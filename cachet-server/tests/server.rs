use std::time::Duration;

use cachet_server::EmbeddedServer;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, RedisResult};

async fn start() -> (EmbeddedServer, Client) {
    let server = EmbeddedServer::bind("127.0.0.1:0").await.expect("bind");
    let client = Client::open(format!("redis://{}/", server.local_addr())).expect("client");
    (server, client)
}

async fn connect(client: &Client) -> MultiplexedConnection {
    client
        .get_multiplexed_async_connection()
        .await
        .expect("connect")
}

async fn query<T: FromRedisValue>(con: &mut MultiplexedConnection, args: &[&str]) -> RedisResult<T> {
    let mut command = redis::cmd(args[0]);
    for arg in &args[1..] {
        command.arg(*arg);
    }
    command.query_async(con).await
}

#[tokio::test]
async fn strings_and_ttl() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    query::<()>(&mut con, &["SET", "key", "value"]).await.expect("set");
    let value: Option<String> = query(&mut con, &["GET", "key"]).await.unwrap();
    assert_eq!(value.as_deref(), Some("value"));
    assert_eq!(query::<i64>(&mut con, &["PTTL", "key"]).await.unwrap(), -1);

    assert!(query::<bool>(&mut con, &["PEXPIRE", "key", "30000"]).await.unwrap());
    let left: i64 = query(&mut con, &["PTTL", "key"]).await.unwrap();
    assert!((0..=30_000).contains(&left));
    assert!(query::<bool>(&mut con, &["PERSIST", "key"]).await.unwrap());
    assert_eq!(query::<i64>(&mut con, &["PTTL", "key"]).await.unwrap(), -1);

    query::<()>(&mut con, &["RENAME", "key", "moved"]).await.unwrap();
    let missing = query::<()>(&mut con, &["RENAME", "key", "again"]).await.unwrap_err();
    assert!(missing.to_string().contains("no such key"));
    assert_eq!(query::<u64>(&mut con, &["DEL", "moved", "missing"]).await.unwrap(), 1);
    assert_eq!(query::<i64>(&mut con, &["PTTL", "moved"]).await.unwrap(), -2);
}

#[tokio::test]
async fn short_ttl_expires() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    query::<()>(&mut con, &["SET", "temp", "v", "PX", "50"]).await.expect("set");
    assert!(query::<bool>(&mut con, &["EXISTS", "temp"]).await.unwrap());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!query::<bool>(&mut con, &["EXISTS", "temp"]).await.unwrap());
}

#[tokio::test]
async fn zero_ttl_write_is_rejected() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    let err = query::<()>(&mut con, &["SET", "k", "v", "PX", "0"]).await.unwrap_err();
    assert!(err.to_string().contains("invalid expire time"));
    assert!(!query::<bool>(&mut con, &["EXISTS", "k"]).await.unwrap());
}

#[tokio::test]
async fn past_pexpireat_removes_key() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    query::<()>(&mut con, &["SET", "key", "v"]).await.unwrap();
    assert!(query::<bool>(&mut con, &["PEXPIREAT", "key", "1000"]).await.unwrap());
    let value: Option<String> = query(&mut con, &["GET", "key"]).await.unwrap();
    assert_eq!(value, None);
}

#[tokio::test]
async fn sets_and_sorted_sets() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    assert_eq!(query::<u64>(&mut con, &["SADD", "s", "a", "b"]).await.unwrap(), 2);
    assert!(query::<bool>(&mut con, &["SISMEMBER", "s", "a"]).await.unwrap());
    assert_eq!(query::<u64>(&mut con, &["SREM", "s", "a", "zz"]).await.unwrap(), 1);
    let members: Vec<String> = query(&mut con, &["SMEMBERS", "s"]).await.unwrap();
    assert_eq!(members, vec!["b".to_string()]);

    assert!(query::<bool>(&mut con, &["ZADD", "z", "2.5", "x"]).await.unwrap());
    assert!(query::<bool>(&mut con, &["ZADD", "z", "1", "y"]).await.unwrap());
    assert!(!query::<bool>(&mut con, &["ZADD", "z", "3", "x"]).await.unwrap());
    let all: Vec<String> = query(&mut con, &["ZRANGEBYSCORE", "z", "-inf", "+inf"]).await.unwrap();
    assert_eq!(all, vec!["y".to_string(), "x".to_string()]);
    assert_eq!(query::<u64>(&mut con, &["ZREMRANGEBYSCORE", "z", "3", "3"]).await.unwrap(), 1);
    let none: Vec<String> = query(&mut con, &["ZRANGEBYSCORE", "z", "3", "3", "LIMIT", "0", "1"])
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn type_reports_value_kind() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    query::<()>(&mut con, &["SET", "text", "v"]).await.unwrap();
    query::<u64>(&mut con, &["SADD", "bag", "m"]).await.unwrap();
    query::<u64>(&mut con, &["ZADD", "ranked", "1", "m"]).await.unwrap();

    assert_eq!(query::<String>(&mut con, &["TYPE", "text"]).await.unwrap(), "string");
    assert_eq!(query::<String>(&mut con, &["TYPE", "bag"]).await.unwrap(), "set");
    assert_eq!(query::<String>(&mut con, &["TYPE", "ranked"]).await.unwrap(), "zset");
    assert_eq!(query::<String>(&mut con, &["TYPE", "missing"]).await.unwrap(), "none");
}

#[tokio::test]
async fn wrong_type_is_a_server_error() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    query::<()>(&mut con, &["SET", "k", "v"]).await.unwrap();
    let err = query::<u64>(&mut con, &["SADD", "k", "m"]).await.unwrap_err();
    assert_eq!(err.code(), Some("WRONGTYPE"));
}

#[tokio::test]
async fn unknown_command_leaves_connection_usable() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    let err = query::<()>(&mut con, &["NOPE"]).await.unwrap_err();
    assert!(err.to_string().contains("unknown command"));
    assert_eq!(query::<String>(&mut con, &["PING"]).await.unwrap(), "PONG");
}

#[tokio::test]
async fn databases_are_isolated() {
    let (server, client) = start().await;
    let fifth_client =
        Client::open(format!("redis://{}/5", server.local_addr())).expect("client");
    let mut first = connect(&client).await;
    let mut fifth = connect(&fifth_client).await;

    query::<()>(&mut first, &["SET", "key", "zero"]).await.unwrap();
    assert_eq!(query::<Option<String>>(&mut fifth, &["GET", "key"]).await.unwrap(), None);
    query::<()>(&mut fifth, &["SET", "key", "five"]).await.unwrap();
    let zero: Option<String> = query(&mut first, &["GET", "key"]).await.unwrap();
    assert_eq!(zero.as_deref(), Some("zero"));
    assert!(server.database(5).is_some());
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let (_server, client) = start().await;
    let mut con = connect(&client).await;

    let (value, exists, kind, removed): (Option<String>, bool, String, u64) = redis::pipe()
        .cmd("SET")
        .arg("a")
        .arg("1")
        .ignore()
        .cmd("GET")
        .arg("a")
        .cmd("EXISTS")
        .arg("a")
        .cmd("TYPE")
        .arg("a")
        .cmd("DEL")
        .arg("a")
        .query_async(&mut con)
        .await
        .expect("pipeline");

    assert_eq!(value.as_deref(), Some("1"));
    assert!(exists);
    assert_eq!(kind, "string");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn publish_reaches_exact_and_pattern_subscribers() {
    let (server, client) = start().await;
    let mut publisher = connect(&client).await;
    let mut pubsub = client.get_async_pubsub().await.expect("subscriber");

    assert_eq!(query::<u64>(&mut publisher, &["PUBLISH", "news.sport", "early"]).await.unwrap(), 0);
    pubsub.subscribe("news.sport").await.unwrap();
    pubsub.psubscribe("news.*").await.unwrap();
    assert_eq!(query::<u64>(&mut publisher, &["PUBLISH", "news.sport", "goal"]).await.unwrap(), 2);

    let mut received = Vec::new();
    {
        let mut messages = pubsub.on_message();
        for _ in 0..2 {
            let message = tokio::time::timeout(Duration::from_secs(1), messages.next())
                .await
                .expect("delivered")
                .expect("open");
            let pattern = message
                .from_pattern()
                .then(|| message.get_pattern::<String>().expect("pattern"));
            received.push((
                message.get_channel_name().to_string(),
                message.get_payload_bytes().to_vec(),
                pattern,
            ));
        }
    }
    assert!(received
        .iter()
        .all(|(channel, payload, _)| channel == "news.sport" && payload == b"goal"));
    assert!(received.iter().any(|(_, _, pattern)| pattern.is_none()));
    assert!(received
        .iter()
        .any(|(_, _, pattern)| pattern.as_deref() == Some("news.*")));

    pubsub.unsubscribe("news.sport").await.unwrap();
    pubsub.punsubscribe("news.*").await.unwrap();
    assert_eq!(query::<u64>(&mut publisher, &["PUBLISH", "news.sport", "late"]).await.unwrap(), 0);
    assert_eq!(server.metrics().snapshot().messages_delivered, 2);
}

#[tokio::test]
async fn subscriber_does_not_block_plain_clients() {
    let (_server, client) = start().await;
    let mut pubsub = client.get_async_pubsub().await.expect("subscriber");
    pubsub.subscribe("chan").await.unwrap();

    let mut con = connect(&client).await;
    assert_eq!(query::<String>(&mut con, &["PING"]).await.unwrap(), "PONG");
    assert_eq!(query::<u64>(&mut con, &["PUBLISH", "chan", "hi"]).await.unwrap(), 1);
}

#[tokio::test]
async fn drop_connections_closes_clients_and_metrics_count_them() {
    let (server, client) = start().await;
    let mut con = connect(&client).await;
    assert_eq!(query::<String>(&mut con, &["PING"]).await.unwrap(), "PONG");

    server.drop_connections();
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while query::<String>(&mut con, &["PING"]).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(closed.is_ok(), "client should observe the close");

    let mut again = connect(&client).await;
    assert_eq!(query::<String>(&mut again, &["PING"]).await.unwrap(), "PONG");
    assert_eq!(server.metrics().snapshot().connections_total, 2);
}

#[tokio::test]
async fn shutdown_refuses_new_connections() {
    let (server, client) = start().await;
    server.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.get_multiplexed_async_connection().await.is_err());
}
