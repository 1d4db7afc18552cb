#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use cachet::StoreConfig;
use cachet_server::EmbeddedServer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: u32,
    pub name: String,
}

pub type PersonList = Vec<Person>;

pub fn joe() -> PersonList {
    vec![Person {
        id: 13,
        name: "Joe".to_string(),
    }]
}

pub async fn start() -> (EmbeddedServer, StoreConfig) {
    let server = EmbeddedServer::bind("127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr();
    let mut config = StoreConfig::new(addr.ip().to_string(), addr.port());
    config.keep_alive = None;
    config.connect_retry = 1;
    config.connect_timeout = Duration::from_secs(1);
    config.operation_timeout = Duration::from_secs(2);
    (server, config)
}

/// Config pointing at a port nobody listens on.
pub fn unreachable_config() -> StoreConfig {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    let mut config = StoreConfig::new("127.0.0.1", port);
    config.keep_alive = None;
    config.connect_retry = 1;
    config.connect_timeout = Duration::from_millis(200);
    config
}

/// Polls `condition` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
