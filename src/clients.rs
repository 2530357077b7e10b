//! Delegated enrichment collaborators.
//!
//! Topic extraction and summarization are remote services; the traits keep
//! the pipeline testable and the HTTP clients swappable.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::store::models::ScrapedArticle;

pub mod extractor;
pub mod summarizer;

pub use extractor::{DelegatedExtractor, DelegationConfig};
pub use summarizer::DelegatedSummarizer;

#[async_trait]
pub trait TopicExtractor: Send + Sync {
    /// Keyword to relevancy score (0..=1) for one article.
    async fn extract_topics(&self, article: &ScrapedArticle) -> Result<HashMap<String, f64>>;
}

#[async_trait]
pub trait ArticleSummarizer: Send + Sync {
    async fn summarize(&self, article: &ScrapedArticle) -> Result<String>;
}

/// The slice of an article the delegated services care about.
#[derive(Debug, Serialize)]
pub(crate) struct ArticlePayload<'a> {
    pub url: &'a str,
    pub title: &'a str,
    pub text: &'a str,
    pub language: &'a str,
}

impl<'a> ArticlePayload<'a> {
    pub(crate) fn from_article(article: &'a ScrapedArticle) -> Self {
        Self {
            url: &article.url,
            title: &article.title,
            text: &article.text,
            language: &article.language,
        }
    }
}
