//! Shared fixtures for router and reaper tests.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

/// Create `events.db` under `dir` with five rows (`id`, `name`, `score`).
pub async fn seeded_events_db(dir: &Path) -> PathBuf {
    let path = dir.join("events.db");
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER)")
        .execute(&pool)
        .await
        .unwrap();
    for (id, name, score) in [(1, "alpha", 10), (2, "beta", 20), (3, "gamma", 30), (4, "delta", 40), (5, "epsilon", 50)] {
        sqlx::query("INSERT INTO events (id, name, score) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(score)
            .execute(&pool)
            .await
            .unwrap();
    }
    pool.close().await;
    path
}
