//! Source-scrape collaborators.
//!
//! One outlet is scraped once per harvest cycle; a failing outlet never
//! aborts its siblings (the conductor isolates each call). Real deployments
//! bring their own per-site implementations; [`generic::GenericHtmlOutlet`]
//! is the config-driven fallback that only needs a front-page URL.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::store::models::ScrapedArticle;

pub mod generic;

pub use generic::GenericHtmlOutlet;

/// Options for one front-page aggregation pass.
#[derive(Debug, Clone, Copy)]
pub struct FrontPageQuery {
    /// Upper bound on articles returned by one outlet in one cycle.
    pub limit: usize,
}

impl Default for FrontPageQuery {
    fn default() -> Self {
        Self { limit: usize::MAX }
    }
}

#[async_trait]
pub trait NewsOutlet: Send + Sync {
    /// Canonical URL identifying this outlet in persisted rows.
    fn outlet_url(&self) -> &str;

    /// Scrape the current front page and return the articles found.
    async fn front_page(&self, query: &FrontPageQuery) -> Result<Vec<ScrapedArticle>>;
}

/// The configured set of outlets, iterated once per harvest cycle.
#[derive(Clone, Default)]
pub struct OutletSet {
    outlets: Vec<Arc<dyn NewsOutlet>>,
}

impl OutletSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, outlet: Arc<dyn NewsOutlet>) {
        self.outlets.push(outlet);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.outlets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn NewsOutlet>> {
        self.outlets.iter()
    }
}
