use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One article as produced by the scrape stage and persisted to
/// `scrape_results`. The source URL is the article's identity everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScrapedArticle {
    pub url: String,
    pub outlet_url: String,
    pub language: String,
    pub title: String,
    pub author: String,
    pub time_posted: DateTime<Utc>,
    pub text: String,
    pub word_count: i64,
    #[sqlx(default)]
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Persisted record of one harvest cycle's time bounds and completion state.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SessionRow {
    pub id: i32,
    pub time_initialized: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    pub is_finished: bool,
}
