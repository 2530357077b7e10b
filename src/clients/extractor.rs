/// 委譲トピック抽出サービスのクライアント。
///
/// ベアラー認証、タイムアウト、一時的エラーの再試行をサポートします。
use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;

use crate::store::models::ScrapedArticle;
use crate::util::retry::{RetryConfig, with_backoff};

use super::{ArticlePayload, TopicExtractor};

/// Shared connection settings for both delegated services.
#[derive(Debug, Clone)]
pub struct DelegationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
struct TopicPair {
    keyword: String,
    popularity: f64,
}

#[derive(Debug, Deserialize)]
struct TopicsResponse {
    map: Vec<TopicPair>,
}

#[derive(Debug, Clone)]
pub struct DelegatedExtractor {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    retry: RetryConfig,
}

impl DelegatedExtractor {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合はエラーを返します。
    pub fn new(config: DelegationConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .context("failed to build extractor HTTP client")?;
        let endpoint = Url::parse(&config.base_url)
            .context("invalid extractor base URL")?
            .join("api/v1/extract")
            .context("failed to build extractor endpoint")?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            retry: config.retry,
        })
    }
}

#[async_trait]
impl TopicExtractor for DelegatedExtractor {
    async fn extract_topics(&self, article: &ScrapedArticle) -> Result<HashMap<String, f64>> {
        let payload = ArticlePayload::from_article(article);
        let payload = &payload;
        let response: TopicsResponse = with_backoff(self.retry, move || async move {
            let mut request = self.client.post(self.endpoint.clone()).json(payload);
            if let Some(key) = self.api_key.as_ref() {
                request = request.bearer_auth(key);
            }
            request
                .send()
                .await?
                .error_for_status()?
                .json::<TopicsResponse>()
                .await
        })
        .await
        .with_context(|| format!("topic extraction failed for {}", article.url))?;

        Ok(response
            .map
            .into_iter()
            .map(|pair| (pair.keyword, pair.popularity))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn article() -> ScrapedArticle {
        ScrapedArticle {
            url: "https://outlet.example/a".to_string(),
            outlet_url: "https://outlet.example".to_string(),
            language: "en".to_string(),
            title: "headline".to_string(),
            author: "desk".to_string(),
            time_posted: chrono::Utc::now(),
            text: "body text".to_string(),
            word_count: 2,
            tags: vec![],
        }
    }

    fn config(base_url: String) -> DelegationConfig {
        DelegationConfig {
            base_url,
            api_key: Some("secret-key".to_string()),
            connect_timeout: Duration::from_secs(3),
            total_timeout: Duration::from_secs(10),
            retry: RetryConfig::new(2, 1, 2),
        }
    }

    #[tokio::test]
    async fn extract_topics_parses_the_keyword_map() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "map": [
                { "keyword": "economy", "popularity": 0.9 },
                { "keyword": "inflation", "popularity": 0.4 }
            ]
        });
        Mock::given(method("POST"))
            .and(path("/api/v1/extract"))
            .and(bearer_token("secret-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let extractor =
            DelegatedExtractor::new(config(server.uri())).expect("client should build");
        let topics = extractor
            .extract_topics(&article())
            .await
            .expect("extraction succeeds");

        assert_eq!(topics.len(), 2);
        assert!((topics["economy"] - 0.9).abs() < f64::EPSILON);
        assert!((topics["inflation"] - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn extract_topics_retries_transient_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extract"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extract"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "map": [] })),
            )
            .mount(&server)
            .await;

        let extractor =
            DelegatedExtractor::new(config(server.uri())).expect("client should build");
        let topics = extractor
            .extract_topics(&article())
            .await
            .expect("second attempt succeeds");

        assert!(topics.is_empty());
    }

    #[tokio::test]
    async fn extract_topics_surfaces_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/extract"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let extractor =
            DelegatedExtractor::new(config(server.uri())).expect("client should build");
        assert!(extractor.extract_topics(&article()).await.is_err());
    }
}
