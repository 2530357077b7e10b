//! Table bootstrap for a fresh database.

use super::provider::{PgStore, StoreError};

const TABLES: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS scrape_sessions (
        id SERIAL PRIMARY KEY,
        time_initialized TIMESTAMPTZ NOT NULL,
        time_end TIMESTAMPTZ NOT NULL,
        is_finished BOOLEAN NOT NULL DEFAULT FALSE
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS scrape_results (
        url TEXT PRIMARY KEY,
        outlet_url TEXT NOT NULL,
        language TEXT NOT NULL DEFAULT '',
        title TEXT NOT NULL DEFAULT '',
        author TEXT NOT NULL DEFAULT '',
        time_posted TIMESTAMPTZ NOT NULL,
        original_text TEXT NOT NULL,
        word_count BIGINT NOT NULL DEFAULT 0
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS article_tags (
        tag TEXT PRIMARY KEY
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS tags_used (
        article_url TEXT NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (article_url, tag)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS unique_keywords (
        keyword TEXT PRIMARY KEY
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS extracted_keywords (
        article_url TEXT NOT NULL,
        keyword TEXT NOT NULL,
        relevancy DOUBLE PRECISION NOT NULL,
        PRIMARY KEY (article_url, keyword)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS summarization_results (
        article_url TEXT PRIMARY KEY,
        summarized_text TEXT NOT NULL
    )
    ",
];

/// Create every harvest table that does not exist yet.
pub async fn initialize(store: &PgStore) -> Result<(), StoreError> {
    for statement in TABLES {
        store
            .with_retry(|pool| async move {
                sqlx::query(statement).execute(&pool).await?;
                Ok(())
            })
            .await?;
    }
    tracing::debug!(tables = TABLES.len(), "harvest schema ensured");
    Ok(())
}
