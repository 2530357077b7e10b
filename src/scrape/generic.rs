//! Config-driven outlet: front-page link discovery plus per-article text
//! extraction, with no site-specific selectors. Good enough to keep the
//! pipeline fed where a dedicated outlet implementation does not exist yet.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Client, Url};

use crate::store::models::ScrapedArticle;

use super::{FrontPageQuery, NewsOutlet};

const TEXT_RENDER_WIDTH: usize = 120;

pub struct GenericHtmlOutlet {
    client: Client,
    front_page: Url,
    language: String,
    href_pattern: Regex,
    title_pattern: Regex,
    keywords_pattern: Regex,
}

impl GenericHtmlOutlet {
    pub fn new(front_page_url: &str, language: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .context("failed to build outlet HTTP client")?;
        let front_page = Url::parse(front_page_url)
            .with_context(|| format!("invalid outlet URL {front_page_url}"))?;

        Ok(Self {
            client,
            front_page,
            language: language.to_string(),
            href_pattern: Regex::new(r#"href\s*=\s*["']([^"'#]+)["']"#)
                .expect("compile href pattern"),
            title_pattern: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
                .expect("compile title pattern"),
            keywords_pattern: Regex::new(
                r#"(?is)<meta[^>]+name\s*=\s*["']keywords["'][^>]+content\s*=\s*["']([^"']*)["']"#,
            )
            .expect("compile keywords pattern"),
        })
    }

    /// Same-host links found on the page, de-duplicated, front-page order.
    fn article_links(&self, html: &str) -> Vec<Url> {
        let mut seen = std::collections::HashSet::new();
        let mut links = Vec::new();
        for capture in self.href_pattern.captures_iter(html) {
            let Ok(resolved) = self.front_page.join(&capture[1]) else {
                continue;
            };
            if resolved.host_str() != self.front_page.host_str() {
                continue;
            }
            if resolved.path().len() <= 1 || resolved == self.front_page {
                continue;
            }
            if seen.insert(resolved.to_string()) {
                links.push(resolved);
            }
        }
        links
    }

    async fn fetch_article(&self, url: Url) -> Result<ScrapedArticle> {
        let html = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let title = self
            .title_pattern
            .captures(&html)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();
        let tags: Vec<String> = self
            .keywords_pattern
            .captures(&html)
            .map(|c| {
                c[1].split(',')
                    .map(|tag| tag.trim().to_string())
                    .filter(|tag| !tag.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let text = html2text::from_read(html.as_bytes(), TEXT_RENDER_WIDTH)
            .map_err(|error| anyhow::anyhow!("failed to render article text: {error}"))?;
        let word_count = i64::try_from(text.split_whitespace().count()).unwrap_or(i64::MAX);

        Ok(ScrapedArticle {
            url: url.to_string(),
            outlet_url: self.front_page.to_string(),
            language: self.language.clone(),
            title,
            author: String::new(),
            time_posted: Utc::now(),
            text,
            word_count,
            tags,
        })
    }
}

#[async_trait]
impl NewsOutlet for GenericHtmlOutlet {
    fn outlet_url(&self) -> &str {
        self.front_page.as_str()
    }

    async fn front_page(&self, query: &FrontPageQuery) -> Result<Vec<ScrapedArticle>> {
        let html = self
            .client
            .get(self.front_page.clone())
            .send()
            .await
            .context("front page request failed")?
            .error_for_status()
            .context("front page returned an error status")?
            .text()
            .await
            .context("failed to read front page body")?;

        let links: Vec<Url> = self.article_links(&html).into_iter().take(query.limit).collect();
        tracing::debug!(outlet = %self.front_page, candidates = links.len(), "front page scanned");

        let mut articles = Vec::with_capacity(links.len());
        let fetched =
            futures::future::join_all(links.into_iter().map(|url| self.fetch_article(url))).await;
        for result in fetched {
            match result {
                Ok(article) => articles.push(article),
                Err(error) => {
                    tracing::warn!(outlet = %self.front_page, error = %error, "article fetch failed");
                }
            }
        }

        Ok(articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn outlet(base: &str) -> GenericHtmlOutlet {
        GenericHtmlOutlet::new(base, "en", Duration::from_secs(5)).expect("outlet builds")
    }

    #[test]
    fn article_links_stay_on_the_outlet_host() {
        let outlet = outlet("https://news.example/");
        let html = r#"
            <a href="/politics/story-1">one</a>
            <a href="https://news.example/economy/story-2?ref=fp">two</a>
            <a href="https://elsewhere.example/story-3">offsite</a>
            <a href="/politics/story-1">duplicate</a>
            <a href="/">home</a>
        "#;

        let links = outlet.article_links(html);
        let paths: Vec<String> = links.iter().map(|u| u.path().to_string()).collect();
        assert_eq!(paths, vec!["/politics/story-1", "/economy/story-2"]);
    }

    #[tokio::test]
    async fn front_page_scrapes_linked_articles() {
        let server = MockServer::start().await;
        let base = format!("{}/", server.uri());

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><a href="/story-a">a</a><a href="/story-b">b</a></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/story-a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><head><title>Story A</title>
                <meta name="keywords" content="alpha, beta"></head>
                <body><p>Alpha body text here.</p></body></html>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/story-b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outlet = outlet(&base);
        let articles = outlet
            .front_page(&FrontPageQuery { limit: 10 })
            .await
            .expect("front page succeeds");

        // story-b 404s and is skipped without failing the outlet.
        assert_eq!(articles.len(), 1);
        let article = &articles[0];
        assert_eq!(article.title, "Story A");
        assert_eq!(article.tags, vec!["alpha", "beta"]);
        assert!(article.text.contains("Alpha body text"));
        assert!(article.word_count > 0);
    }

    #[tokio::test]
    async fn front_page_honors_the_scrape_limit() {
        let server = MockServer::start().await;
        let base = format!("{}/", server.uri());

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<a href="/s1">1</a><a href="/s2">2</a><a href="/s3">3</a>"#,
            ))
            .mount(&server)
            .await;
        for story in ["/s1", "/s2", "/s3"] {
            Mock::given(method("GET"))
                .and(path(story))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("<html><title>s</title><body>text</body></html>"),
                )
                .mount(&server)
                .await;
        }

        let outlet = outlet(&base);
        let articles = outlet
            .front_page(&FrontPageQuery { limit: 2 })
            .await
            .expect("front page succeeds");
        assert_eq!(articles.len(), 2);
    }
}
