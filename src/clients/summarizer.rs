/// 委譲要約サービスのクライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::store::models::ScrapedArticle;
use crate::util::retry::{RetryConfig, with_backoff};

use super::{ArticlePayload, ArticleSummarizer, extractor::DelegationConfig};

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summarized: String,
}

#[derive(Debug, Clone)]
pub struct DelegatedSummarizer {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    retry: RetryConfig,
}

impl DelegatedSummarizer {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返します。
    pub fn new(config: DelegationConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build summarizer HTTP client")?;
        let endpoint = Url::parse(&config.base_url)
            .context("invalid summarizer base URL")?
            .join("api/v1/summarize")
            .context("failed to build summarizer endpoint")?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            retry: config.retry,
        })
    }
}

#[async_trait]
impl ArticleSummarizer for DelegatedSummarizer {
    async fn summarize(&self, article: &ScrapedArticle) -> Result<String> {
        let payload = ArticlePayload::from_article(article);
        let payload = &payload;
        let response: SummaryResponse = with_backoff(self.retry, move || async move {
            let mut request = self.client.post(self.endpoint.clone()).json(payload);
            if let Some(key) = self.api_key.as_ref() {
                request = request.bearer_auth(key);
            }
            request
                .send()
                .await?
                .error_for_status()?
                .json::<SummaryResponse>()
                .await
        })
        .await
        .with_context(|| format!("summarization failed for {}", article.url))?;

        Ok(response.summarized)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article() -> ScrapedArticle {
        ScrapedArticle {
            url: "https://outlet.example/long-read".to_string(),
            outlet_url: "https://outlet.example".to_string(),
            language: "en".to_string(),
            title: "long read".to_string(),
            author: "desk".to_string(),
            time_posted: chrono::Utc::now(),
            text: "a very long body".to_string(),
            word_count: 4,
            tags: vec![],
        }
    }

    fn config(base_url: String) -> DelegationConfig {
        DelegationConfig {
            base_url,
            api_key: None,
            connect_timeout: Duration::from_secs(3),
            total_timeout: Duration::from_secs(10),
            retry: RetryConfig::new(2, 1, 2),
        }
    }

    #[tokio::test]
    async fn summarize_returns_the_delegated_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/summarize"))
            .and(body_partial_json(
                serde_json::json!({ "url": "https://outlet.example/long-read" }),
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "summarized": "short version" })),
            )
            .mount(&server)
            .await;

        let summarizer =
            DelegatedSummarizer::new(config(server.uri())).expect("client should build");
        let summary = summarizer
            .summarize(&article())
            .await
            .expect("summarization succeeds");

        assert_eq!(summary, "short version");
    }

    #[tokio::test]
    async fn summarize_fails_after_exhausting_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/summarize"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let summarizer =
            DelegatedSummarizer::new(config(server.uri())).expect("client should build");
        assert!(summarizer.summarize(&article()).await.is_err());
    }
}
