use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::models::{Consumer, Producer};

pub type DbPool = Pool<Postgres>;

pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

// ============================================================================
// Producers
// ============================================================================

pub async fn create_producer(pool: &DbPool, producer: &Producer) -> Result<Producer, sqlx::Error> {
    sqlx::query_as::<_, Producer>(
        r#"
        INSERT INTO producers
            (id, username, password_hash, project_id, broker, strategy,
             exchange, queue, routing_key, headers)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(&producer.id)
    .bind(&producer.username)
    .bind(&producer.password_hash)
    .bind(&producer.project_id)
    .bind(&producer.broker)
    .bind(&producer.strategy)
    .bind(&producer.exchange)
    .bind(&producer.queue)
    .bind(&producer.routing_key)
    .bind(&producer.headers)
    .fetch_one(pool)
    .await
}

pub async fn get_producer(pool: &DbPool, id: &str) -> Result<Option<Producer>, sqlx::Error> {
    sqlx::query_as::<_, Producer>("SELECT * FROM producers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn producer_username_exists(
    pool: &DbPool,
    username: &str,
) -> Result<bool, sqlx::Error> {
    let exists: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM producers WHERE username = $1 LIMIT 1")
            .bind(username)
            .fetch_optional(pool)
            .await?;
    Ok(exists.is_some())
}

pub async fn delete_producer(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM producers WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Persist a routing-field change. The service computes the full new field
/// set; the row is replaced wholesale to keep update semantics in one
/// place.
pub async fn update_producer_routing(
    pool: &DbPool,
    producer: &Producer,
) -> Result<Producer, sqlx::Error> {
    sqlx::query_as::<_, Producer>(
        r#"
        UPDATE producers
        SET broker = $2, strategy = $3, exchange = $4, queue = $5,
            routing_key = $6, headers = $7, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(&producer.id)
    .bind(&producer.broker)
    .bind(&producer.strategy)
    .bind(&producer.exchange)
    .bind(&producer.queue)
    .bind(&producer.routing_key)
    .bind(&producer.headers)
    .fetch_one(pool)
    .await
}

// ============================================================================
// Consumers
// ============================================================================

pub async fn create_consumer(pool: &DbPool, consumer: &Consumer) -> Result<Consumer, sqlx::Error> {
    sqlx::query_as::<_, Consumer>(
        r#"
        INSERT INTO consumers
            (id, username, password_hash, project_id, persistence_time_ms,
             broker, strategy, exchange, queue, routing_key, headers)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *
        "#,
    )
    .bind(&consumer.id)
    .bind(&consumer.username)
    .bind(&consumer.password_hash)
    .bind(&consumer.project_id)
    .bind(consumer.persistence_time_ms)
    .bind(&consumer.broker)
    .bind(&consumer.strategy)
    .bind(&consumer.exchange)
    .bind(&consumer.queue)
    .bind(&consumer.routing_key)
    .bind(&consumer.headers)
    .fetch_one(pool)
    .await
}

pub async fn get_consumer(pool: &DbPool, id: &str) -> Result<Option<Consumer>, sqlx::Error> {
    sqlx::query_as::<_, Consumer>("SELECT * FROM consumers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn consumer_username_exists(
    pool: &DbPool,
    username: &str,
) -> Result<bool, sqlx::Error> {
    let exists: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM consumers WHERE username = $1 LIMIT 1")
            .bind(username)
            .fetch_optional(pool)
            .await?;
    Ok(exists.is_some())
}

pub async fn delete_consumer(pool: &DbPool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM consumers WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_consumer_routing(
    pool: &DbPool,
    consumer: &Consumer,
) -> Result<Consumer, sqlx::Error> {
    sqlx::query_as::<_, Consumer>(
        r#"
        UPDATE consumers
        SET broker = $2, strategy = $3, exchange = $4, queue = $5,
            routing_key = $6, headers = $7, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(&consumer.id)
    .bind(&consumer.broker)
    .bind(&consumer.strategy)
    .bind(&consumer.exchange)
    .bind(&consumer.queue)
    .bind(&consumer.routing_key)
    .bind(&consumer.headers)
    .fetch_one(pool)
    .await
}

pub async fn update_consumer_persistence(
    pool: &DbPool,
    id: &str,
    persistence_time_ms: i64,
) -> Result<Consumer, sqlx::Error> {
    sqlx::query_as::<_, Consumer>(
        r#"
        UPDATE consumers
        SET persistence_time_ms = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(persistence_time_ms)
    .fetch_one(pool)
    .await
}
