//! Persistence operations used by the harvest pipeline, behind a trait so
//! the conductor can run against an in-memory double in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::ScrapedArticle;
use super::provider::PgStore;

/// Result of persisting one scraped article. A duplicate key means the
/// article is already in the corpus, which is success for an idempotent
/// upsert-style insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// End timestamp of the latest finished session, if any.
    async fn last_finished_session_end(&self) -> Result<Option<DateTime<Utc>>>;

    /// Open an unfinished session row; the provisional end time is the
    /// previous cycle's end, a safety default should this cycle never close.
    async fn open_session(
        &self,
        started: DateTime<Utc>,
        provisional_end: DateTime<Utc>,
    ) -> Result<i32>;

    /// Mark the session finished; returns the number of rows updated.
    async fn close_session(&self, session_id: i32, ended: DateTime<Utc>) -> Result<u64>;

    async fn insert_article(&self, article: &ScrapedArticle) -> Result<InsertOutcome>;

    async fn save_summary(&self, article_url: &str, summary: &str) -> Result<()>;

    async fn save_keywords(&self, article_url: &str, keywords: &[(String, f64)]) -> Result<()>;

    /// Delete articles strictly older than `threshold` together with their
    /// dependent rows; returns the total number of rows removed.
    async fn collect_garbage(&self, threshold: DateTime<Utc>) -> Result<u64>;

    async fn article_by_url(&self, url: &str) -> Result<Option<ScrapedArticle>>;

    async fn all_articles(&self) -> Result<Vec<ScrapedArticle>>;
}

const SELECT_ARTICLE_COLUMNS: &str = r"
    SELECT url, outlet_url, language, title, author, time_posted,
           original_text AS text, word_count
    FROM scrape_results
";

pub struct PgHarvestStore {
    store: PgStore,
}

impl PgHarvestStore {
    #[must_use]
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HarvestStore for PgHarvestStore {
    async fn last_finished_session_end(&self) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .store
            .with_retry(|pool| async move {
                sqlx::query(
                    r"
                    SELECT time_end FROM scrape_sessions
                    WHERE is_finished = true
                    ORDER BY time_end DESC
                    LIMIT 1
                    ",
                )
                .fetch_optional(&pool)
                .await
            })
            .await
            .context("failed to look up the latest finished session")?;

        match row {
            Some(row) => Ok(Some(row.try_get("time_end")?)),
            None => Ok(None),
        }
    }

    async fn open_session(
        &self,
        started: DateTime<Utc>,
        provisional_end: DateTime<Utc>,
    ) -> Result<i32> {
        let row = self
            .store
            .with_retry(|pool| async move {
                sqlx::query(
                    r"
                    INSERT INTO scrape_sessions (time_initialized, time_end, is_finished)
                    VALUES ($1, $2, false)
                    RETURNING id
                    ",
                )
                .bind(started)
                .bind(provisional_end)
                .fetch_one(&pool)
                .await
            })
            .await
            .context("failed to open a harvest session")?;

        Ok(row.try_get("id")?)
    }

    async fn close_session(&self, session_id: i32, ended: DateTime<Utc>) -> Result<u64> {
        let affected = self
            .store
            .with_retry(|pool| async move {
                let done = sqlx::query(
                    r"
                    UPDATE scrape_sessions
                    SET time_end = $1, is_finished = true
                    WHERE id = $2
                    ",
                )
                .bind(ended)
                .bind(session_id)
                .execute(&pool)
                .await?;
                Ok(done.rows_affected())
            })
            .await
            .context("failed to close the harvest session")?;

        Ok(affected)
    }

    async fn insert_article(&self, article: &ScrapedArticle) -> Result<InsertOutcome> {
        let outcome = self
            .store
            .with_retry(|pool| async move {
                let mut tx = pool.begin().await?;
                let inserted = sqlx::query(
                    r"
                    INSERT INTO scrape_results
                        (url, outlet_url, language, title, author, time_posted,
                         original_text, word_count)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ",
                )
                .bind(&article.url)
                .bind(&article.outlet_url)
                .bind(&article.language)
                .bind(&article.title)
                .bind(&article.author)
                .bind(article.time_posted)
                .bind(&article.text)
                .bind(article.word_count)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                        // Rolls back on drop; the article is already present.
                        return Ok(InsertOutcome::AlreadyPresent);
                    }
                    Err(error) => return Err(error),
                    Ok(_) => {}
                }

                for tag in &article.tags {
                    sqlx::query(
                        r"INSERT INTO article_tags (tag) VALUES ($1) ON CONFLICT DO NOTHING",
                    )
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        r"
                        INSERT INTO tags_used (article_url, tag)
                        VALUES ($1, $2)
                        ON CONFLICT DO NOTHING
                        ",
                    )
                    .bind(&article.url)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;
                Ok(InsertOutcome::Inserted)
            })
            .await
            .with_context(|| format!("failed to insert article {}", article.url))?;

        Ok(outcome)
    }

    async fn save_summary(&self, article_url: &str, summary: &str) -> Result<()> {
        self.store
            .with_retry(|pool| async move {
                sqlx::query(
                    r"
                    INSERT INTO summarization_results (article_url, summarized_text)
                    VALUES ($1, $2)
                    ON CONFLICT DO NOTHING
                    ",
                )
                .bind(article_url)
                .bind(summary)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await
            .with_context(|| format!("failed to save summary for {article_url}"))?;

        Ok(())
    }

    async fn save_keywords(&self, article_url: &str, keywords: &[(String, f64)]) -> Result<()> {
        if keywords.is_empty() {
            return Ok(());
        }

        self.store
            .with_retry(|pool| async move {
                let mut tx = pool.begin().await?;
                for (keyword, relevancy) in keywords {
                    sqlx::query(
                        r"INSERT INTO unique_keywords (keyword) VALUES ($1) ON CONFLICT DO NOTHING",
                    )
                    .bind(keyword)
                    .execute(&mut *tx)
                    .await?;
                    sqlx::query(
                        r"
                        INSERT INTO extracted_keywords (article_url, keyword, relevancy)
                        VALUES ($1, $2, $3)
                        ON CONFLICT DO NOTHING
                        ",
                    )
                    .bind(article_url)
                    .bind(keyword)
                    .bind(relevancy)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await
            .with_context(|| format!("failed to save keywords for {article_url}"))?;

        Ok(())
    }

    async fn collect_garbage(&self, threshold: DateTime<Utc>) -> Result<u64> {
        let affected = self
            .store
            .with_retry(|pool| async move {
                let mut tx = pool.begin().await?;
                let mut affected = 0;
                for dependent in [
                    r"
                    DELETE FROM tags_used WHERE article_url IN
                        (SELECT url FROM scrape_results WHERE time_posted < $1)
                    ",
                    r"
                    DELETE FROM extracted_keywords WHERE article_url IN
                        (SELECT url FROM scrape_results WHERE time_posted < $1)
                    ",
                    r"
                    DELETE FROM summarization_results WHERE article_url IN
                        (SELECT url FROM scrape_results WHERE time_posted < $1)
                    ",
                    r"DELETE FROM scrape_results WHERE time_posted < $1",
                ] {
                    let done = sqlx::query(dependent)
                        .bind(threshold)
                        .execute(&mut *tx)
                        .await?;
                    affected += done.rows_affected();
                }
                tx.commit().await?;
                Ok(affected)
            })
            .await
            .context("failed to garbage collect expired articles")?;

        Ok(affected)
    }

    async fn article_by_url(&self, url: &str) -> Result<Option<ScrapedArticle>> {
        let sql = format!("{SELECT_ARTICLE_COLUMNS} WHERE url = $1");
        let article = self
            .store
            .with_retry(|pool| {
                let sql = sql.clone();
                async move {
                    sqlx::query_as::<_, ScrapedArticle>(&sql)
                        .bind(url)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await
            .with_context(|| format!("failed to query article {url}"))?;

        Ok(article)
    }

    async fn all_articles(&self) -> Result<Vec<ScrapedArticle>> {
        let articles = self
            .store
            .with_retry(|pool| async move {
                sqlx::query_as::<_, ScrapedArticle>(SELECT_ARTICLE_COLUMNS)
                    .fetch_all(&pool)
                    .await
            })
            .await
            .context("failed to query articles")?;

        Ok(articles)
    }
}
