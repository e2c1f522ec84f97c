use pg_stream::config::{Config, PostgresConfig, ReplicationConfig};
use std::env;
use tokio_postgres::{Client, NoTls};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
        application_name: "pg-stream-test".to_string(),
    };

    let replication = ReplicationConfig {
        polling_timeout_ms: 200,
        auto_create_slot: true,
        ..ReplicationConfig::default()
    };

    Config {
        postgres,
        replication,
        slots: Vec::new(),
    }
}

/// Unique per test process, so parallel runs do not share slots.
pub fn slot_name(test: &str) -> String {
    format!("pg_stream_{}_{}", test, std::process::id())
}

pub async fn connect(config: &Config) -> Client {
    let pg = &config.postgres;
    let (client, connection) = tokio_postgres::Config::new()
        .host(&pg.host)
        .port(pg.port)
        .dbname(&pg.database)
        .user(&pg.username)
        .password(&pg.password)
        .connect(NoTls)
        .await
        .expect("connect to test database");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

pub async fn drop_slot(client: &Client, slot: &str) {
    client
        .execute(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
             WHERE slot_name = $1 AND NOT active",
            &[&slot],
        )
        .await
        .ok();
}
