//! Redis pub/sub backend.
//!
//! Command connections are multiplexed async connections, one per pool
//! slot. The subscription connection is a dedicated `PubSub` connection.

use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Client, RedisError};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::time::timeout;
use tracing::debug;

use relay_core::logging::redact_url;
use relay_core::{BackendChannel, BusConfig, Error, Result};

use super::{Backend, BackendConnection, RawMessage, SubscriptionConnection};

fn connection_error(e: RedisError) -> Error {
    Error::Connection(e.to_string())
}

fn raw_message(msg: ::redis::Msg) -> RawMessage {
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    RawMessage::new(
        msg.get_channel_name(),
        pattern,
        msg.get_payload_bytes().to_vec(),
    )
}

/// Backend connecting to a Redis server.
pub struct RedisBackend {
    client: Client,
    url: String,
    connect_timeout: Duration,
}

impl RedisBackend {
    /// Create a backend for `config.backend_url`. No connection is opened yet.
    pub fn new(config: &BusConfig) -> Result<Self> {
        let client = Client::open(config.backend_url.as_str()).map_err(|e| {
            Error::Config(format!(
                "invalid Redis URL {}: {}",
                redact_url(&config.backend_url),
                e
            ))
        })?;
        Ok(Self {
            client,
            url: redact_url(&config.backend_url),
            connect_timeout: config.connect_timeout,
        })
    }

    async fn with_connect_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, RedisError>>,
    {
        match timeout(self.connect_timeout, fut).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(connection_error(e)),
            Err(_) => Err(Error::Connection(format!(
                "connect to {} timed out after {}s",
                self.url,
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn connect(&self) -> Result<Box<dyn BackendConnection>> {
        let conn = self
            .with_connect_timeout(self.client.get_multiplexed_async_connection())
            .await?;
        debug!(backend = %self.url, "Opened Redis command connection");
        Ok(Box::new(RedisConnection { conn }))
    }

    async fn connect_subscriber(&self) -> Result<Box<dyn SubscriptionConnection>> {
        let pubsub = self
            .with_connect_timeout(self.client.get_async_pubsub())
            .await?;
        debug!(backend = %self.url, "Opened Redis subscription connection");
        Ok(Box::new(RedisSubscription {
            pubsub: Some(pubsub),
        }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl BackendConnection for RedisConnection {
    async fn publish(&mut self, channel: &str, payload: Vec<u8>) -> Result<i64> {
        self.conn
            .publish::<_, _, i64>(channel, payload)
            .await
            .map_err(connection_error)
    }

    async fn ping(&mut self) -> Result<()> {
        let pong: String = ::redis::cmd("PING")
            .query_async(&mut self.conn)
            .await
            .map_err(connection_error)?;
        if pong != "PONG" {
            return Err(Error::Connection(format!("unexpected PING reply {:?}", pong)));
        }
        Ok(())
    }
}

struct RedisSubscription {
    pubsub: Option<PubSub>,
}

impl RedisSubscription {
    fn pubsub(&mut self) -> Result<&mut PubSub> {
        self.pubsub
            .as_mut()
            .ok_or_else(|| Error::Connection("subscription connection is closed".into()))
    }
}

#[async_trait]
impl SubscriptionConnection for RedisSubscription {
    async fn subscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        let pubsub = self.pubsub()?;
        let result = match channel {
            BackendChannel::Channel(c) => pubsub.subscribe(c.as_str()).await,
            BackendChannel::Pattern(p) => pubsub.psubscribe(p.as_str()).await,
        };
        result.map_err(connection_error)
    }

    async fn unsubscribe(&mut self, channel: &BackendChannel) -> Result<()> {
        let pubsub = self.pubsub()?;
        let result = match channel {
            BackendChannel::Channel(c) => pubsub.unsubscribe(c.as_str()).await,
            BackendChannel::Pattern(p) => pubsub.punsubscribe(p.as_str()).await,
        };
        result.map_err(connection_error)
    }

    async fn next_message(&mut self) -> Result<Option<RawMessage>> {
        let pubsub = self.pubsub()?;
        Ok(pubsub.on_message().next().await.map(raw_message))
    }

    fn take_buffered(&mut self) -> Vec<RawMessage> {
        let Some(pubsub) = self.pubsub.as_mut() else {
            return Vec::new();
        };
        let mut stream = pubsub.on_message();
        let mut buffered = Vec::new();
        while let Some(Some(msg)) = stream.next().now_or_never() {
            buffered.push(raw_message(msg));
        }
        buffered
    }

    async fn close(&mut self) {
        self.pubsub = None;
    }
}
