//! Shared helpers for database integration tests
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p assessctl-store -- --ignored

#![allow(dead_code)]

use assessctl_store::{AssessmentStateStore, NewAssessment, Payload, StoreConfig};
use sqlx::postgres::PgConnectOptions;

pub const MAX_RETRIES: i32 = 3;

pub fn test_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.max_retries = MAX_RETRIES;
    config.pool.min_connections = 0;
    config.pool.max_connections = 4;
    config.transaction.retry_delay_ms = 10;
    config.transaction.max_delay_ms = 50;
    config
}

pub async fn open_store(connect: PgConnectOptions) -> AssessmentStateStore {
    open_store_with(test_config(), connect).await
}

pub async fn open_store_with(config: StoreConfig, connect: PgConnectOptions) -> AssessmentStateStore {
    AssessmentStateStore::open_with(config, connect)
        .await
        .expect("store should open against the test database")
}

pub fn request(target: &str) -> NewAssessment {
    let payload = Payload::from_json_str(1, &format!(r#"{{"target":"{}","depth":2}}"#, target))
        .expect("valid payload");
    NewAssessment::new(target, "baseline", payload)
}
