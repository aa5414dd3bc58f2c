// ============================================================================
// Retained-message store (Redis)
// ============================================================================
//
// Messages delivered to a consumer with retention enabled are kept here
// until the consumer deletes them or the retention window ends. The stamped
// expiry drives the Redis TTL, so expired rows disappear without a sweeper;
// list reads prune ids whose row is already gone.
//
// Messages without an expiry (retention zero) are never written at all.
//
// ============================================================================

use anyhow::Result;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client};

use crate::error::{AppError, AppResult};
use crate::models::RetainedMessage;

pub struct MessageStore {
    conn: ConnectionManager,
}

fn message_key(consumer_id: &str, message_id: &str) -> String {
    format!("retained:{}:{}", consumer_id, message_id)
}

fn id_set_key(consumer_id: &str) -> String {
    format!("retained_ids:{}", consumer_id)
}

impl MessageStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| anyhow::anyhow!("Failed to parse Redis URL: {}", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to Redis: {}", e))?;
        Ok(Self { conn })
    }

    /// Persist a retained copy. A message without an expiry is retention-
    /// disabled and is not stored.
    pub async fn persist(&self, message: &RetainedMessage) -> AppResult<()> {
        let Some(expire_at) = message.expire_at else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(message)?;
        let ttl_secs = (expire_at - Utc::now()).num_seconds().max(1) as u64;

        let _: () = conn
            .set_ex(
                message_key(&message.consumer_id, &message.message_id),
                payload,
                ttl_secs,
            )
            .await?;
        let _: () = conn
            .sadd(id_set_key(&message.consumer_id), &message.message_id)
            .await?;

        tracing::debug!(
            consumer_id = %message.consumer_id,
            message_id = %message.message_id,
            ttl_secs,
            "Retained message persisted"
        );
        Ok(())
    }

    pub async fn list(&self, consumer_id: &str) -> AppResult<Vec<RetainedMessage>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(id_set_key(consumer_id)).await?;

        let mut messages = Vec::new();
        let mut stale = Vec::new();
        for id in ids {
            let raw: Option<String> = conn.get(message_key(consumer_id, &id)).await?;
            match raw {
                Some(json) => match serde_json::from_str::<RetainedMessage>(&json) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        tracing::error!(consumer_id = %consumer_id, message_id = %id, error = %e, "Corrupt retained message dropped");
                        stale.push(id);
                    }
                },
                // Row expired out from under the id set.
                None => stale.push(id),
            }
        }

        if !stale.is_empty() {
            let _: () = conn.srem(id_set_key(consumer_id), &stale).await?;
        }

        Ok(messages)
    }

    pub async fn get(&self, consumer_id: &str, message_id: &str) -> AppResult<RetainedMessage> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(message_key(consumer_id, message_id)).await?;
        let json = raw.ok_or_else(|| {
            AppError::MessageNotFound(format!(
                "Message '{}' for consumer '{}' not found",
                message_id, consumer_id
            ))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    pub async fn delete(&self, consumer_id: &str, message_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(message_key(consumer_id, message_id)).await?;
        let _: () = conn.srem(id_set_key(consumer_id), message_id).await?;
        if removed == 0 {
            return Err(AppError::MessageNotFound(format!(
                "Message '{}' for consumer '{}' not found",
                message_id, consumer_id
            )));
        }
        Ok(())
    }

    /// Purge everything retained for a consumer (used on consumer delete).
    pub async fn delete_all(&self, consumer_id: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(id_set_key(consumer_id)).await?;
        for id in &ids {
            let _: () = conn.del(message_key(consumer_id, id)).await?;
        }
        let _: () = conn.del(id_set_key(consumer_id)).await?;
        if !ids.is_empty() {
            tracing::info!(consumer_id = %consumer_id, count = ids.len(), "Purged retained messages");
        }
        Ok(())
    }

    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
