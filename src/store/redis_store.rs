use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::store::CoordinationStore;

/// Redis-backed coordination store.
///
/// Values are stored as JSON strings. Commands go through a
/// [`ConnectionManager`], which reconnects transparently; subscriptions use a
/// dedicated pub/sub connection (see [`RedisStore::subscribe`]).
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!(host = %config.host, port = config.port, "Connected to coordination store");
        Ok(Self { client, conn })
    }

    /// Subscribe to `channels` and forward `(channel, payload)` pairs into the
    /// returned receiver. The forwarding task ends when the receiver is dropped
    /// or the connection closes.
    pub async fn subscribe(&self, channels: &[&str]) -> Result<mpsc::Receiver<(String, String)>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
            tracing::debug!(channel, "Subscribed to channel");
        }

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Dropping non-text message");
                        continue;
                    }
                };
                if tx.send((channel, payload)).await.is_err() {
                    break;
                }
            }
            tracing::warn!("Coordination store subscription ended");
        });

        Ok(rx)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, i64>(channel, payload).await?;
        Ok(())
    }
}
