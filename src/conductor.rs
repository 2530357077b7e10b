//! The harvest conductor.
//!
//! One harvest cycle: open a session row, fan out one scrape task per
//! configured outlet, insert every scraped article concurrently while
//! recording per-item completion, run the two enrichment stages over the
//! items whose insert succeeded (each stage capped by its own choker), close
//! the session. A recurring garbage-collection cycle prunes articles older
//! than the retention window. Both cycles are driven by the daemon tick and
//! tracked while in flight so a slow cycle can never overlap itself.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::clients::{ArticleSummarizer, TopicExtractor};
use crate::exec::daemon::{self, Daemon, DaemonHandle};
use crate::exec::resource::{Choker, choker};
use crate::exec::{ExecError, panic_message};
use crate::logging::LogRelay;
use crate::scrape::{FrontPageQuery, OutletSet};
use crate::store::harvest::{HarvestStore, InsertOutcome};
use crate::store::models::ScrapedArticle;

pub mod keywords;

/// How the two enrichment stages fan out over an eligible batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// All extractions finish before any summarization starts.
    #[default]
    Sequential,
    /// Every eligible item launches both calls at once.
    Dual,
}

impl FromStr for SyncStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "SEQUENTIAL" => Ok(Self::Sequential),
            "DUAL" => Ok(Self::Dual),
            other => Err(format!("unknown sync strategy: {other}")),
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "SEQUENTIAL"),
            Self::Dual => write!(f, "DUAL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConductorSettings {
    pub harvest_interval: Duration,
    pub gc_interval: Duration,
    /// Articles strictly older than this are garbage collected.
    pub retention: Duration,
    pub tick_interval: Duration,
    pub scrape_limit: usize,
    pub strategy: SyncStrategy,
    pub extractor_cap: usize,
    /// Zero means "share the extractor's choker".
    pub summarizer_cap: usize,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            harvest_interval: Duration::from_secs(60 * 60 * 24),
            gc_interval: Duration::from_secs(60 * 60 * 12),
            retention: Duration::from_secs(60 * 60 * 12),
            tick_interval: Duration::from_secs(10),
            scrape_limit: usize::MAX,
            strategy: SyncStrategy::Sequential,
            extractor_cap: 16,
            summarizer_cap: 0,
        }
    }
}

/// Per-stage `(succeeded / attempted)` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCount {
    pub attempted: usize,
    pub succeeded: usize,
}

#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub session_id: i32,
    pub scraped: usize,
    pub inserted: usize,
    pub extraction: StageCount,
    pub summarization: StageCount,
}

/// The cycle logic, free of scheduling state so in-flight cycles can be
/// tracked from spawned tasks.
pub struct HarvestCore {
    store: Arc<dyn HarvestStore>,
    outlets: OutletSet,
    extractor: Arc<dyn TopicExtractor>,
    summarizer: Arc<dyn ArticleSummarizer>,
    extractor_choker: Choker,
    summarizer_choker: Choker,
    relay: LogRelay,
    settings: ConductorSettings,
}

impl HarvestCore {
    #[must_use]
    pub fn new(
        store: Arc<dyn HarvestStore>,
        outlets: OutletSet,
        extractor: Arc<dyn TopicExtractor>,
        summarizer: Arc<dyn ArticleSummarizer>,
        relay: LogRelay,
        settings: ConductorSettings,
    ) -> Self {
        let extractor_choker = choker(settings.extractor_cap);
        let summarizer_choker = if settings.summarizer_cap == 0 {
            tracing::warn!(
                extractor_cap = settings.extractor_cap,
                "summarizer cap unset, sharing the extractor choker; combined enrichment throughput is halved"
            );
            extractor_choker.clone()
        } else {
            choker(settings.summarizer_cap)
        };
        Self {
            store,
            outlets,
            extractor,
            summarizer,
            extractor_choker,
            summarizer_choker,
            relay,
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ConductorSettings {
        &self.settings
    }

    /// True when both enrichment stages draw permits from one pool.
    #[must_use]
    pub fn chokers_shared(&self) -> bool {
        self.extractor_choker
            .shares_permits_with(&self.summarizer_choker)
    }

    /// Run one full harvest cycle. `previous_end` is the provisional session
    /// end recorded until the cycle commits.
    pub async fn run_harvest_cycle(&self, previous_end: DateTime<Utc>) -> Result<HarvestReport> {
        let cycle_started = Utc::now();
        let session_id = self
            .store
            .open_session(cycle_started, previous_end)
            .await
            .context("could not open a harvest session")?;
        self.relay
            .message("harvest", format!("session {session_id} opened"));

        let batch = self.scrape_all().await;
        let completion = self.insert_batch(&batch).await;
        let inserted = completion.iter().filter(|ok| **ok).count();
        let (extraction, summarization) = self.enrich(&batch, &completion).await;

        let ended = Utc::now();
        let affected = self
            .store
            .close_session(session_id, ended)
            .await
            .context("could not close the harvest session")?;
        if affected == 0 {
            self.relay.exception(
                "harvest",
                format!("could not commit session with id {session_id}"),
                "session update affected zero rows",
            );
        }

        let report = HarvestReport {
            session_id,
            scraped: batch.len(),
            inserted,
            extraction,
            summarization,
        };
        self.relay.write(
            "harvest",
            format!(
                "session {session_id} committed: {} scraped, {inserted} inserted, \
                 extraction {}/{}, summarization {}/{}",
                report.scraped,
                extraction.succeeded,
                extraction.attempted,
                summarization.succeeded,
                summarization.attempted,
            ),
            crate::logging::Severity::Message,
            Some(serde_json::json!({
                "strategy": self.settings.strategy.to_string(),
                "elapsed_ms": (ended - cycle_started).num_milliseconds(),
            })),
        );
        Ok(report)
    }

    /// Delete everything strictly older than the retention window, together
    /// with dependent rows; returns the affected-row count.
    pub async fn run_gc_cycle(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.settings.retention)
            .context("retention window out of range")?;
        let threshold = Utc::now() - retention;
        let affected = self.store.collect_garbage(threshold).await?;
        if affected > 0 {
            self.relay.message(
                "gc",
                format!("garbage collected, affected rows: {affected}"),
            );
        }
        Ok(affected)
    }

    /// Delegated extraction without persistence, for the realtime surface.
    pub async fn extract_topics(&self, article: &ScrapedArticle) -> Result<HashMap<String, f64>> {
        self.extractor.extract_topics(article).await
    }

    /// Delegated summarization without persistence, for the realtime surface.
    pub async fn summarize_article(&self, article: &ScrapedArticle) -> Result<String> {
        self.summarizer.summarize(article).await
    }

    /// One fully concurrent scrape task per outlet; a failing outlet is
    /// logged and contributes nothing.
    async fn scrape_all(&self) -> Vec<ScrapedArticle> {
        let query = FrontPageQuery {
            limit: self.settings.scrape_limit,
        };
        let tasks: Vec<_> = self
            .outlets
            .iter()
            .map(|outlet| {
                let outlet = Arc::clone(outlet);
                tokio::spawn(async move {
                    let outlet_url = outlet.outlet_url().to_string();
                    (outlet_url, outlet.front_page(&query).await)
                })
            })
            .collect();

        let mut batch = Vec::new();
        for task in tasks {
            match task.await {
                Ok((outlet_url, Ok(articles))) => {
                    tracing::info!(outlet = %outlet_url, articles = articles.len(), "outlet scraped");
                    batch.extend(articles);
                }
                Ok((outlet_url, Err(error))) => {
                    self.relay.exception(
                        "harvest/scrape",
                        format!("scrape failed for outlet {outlet_url}"),
                        format!("{error:#}"),
                    );
                }
                Err(join_error) => {
                    self.relay.exception(
                        "harvest/scrape",
                        "scrape task aborted",
                        join_error.to_string(),
                    );
                }
            }
        }
        batch
    }

    /// Fully concurrent inserts; the returned vector is index-aligned with
    /// the batch and is the only input later stages consult for eligibility.
    async fn insert_batch(&self, batch: &[ScrapedArticle]) -> Vec<bool> {
        join_all(batch.iter().map(|article| async move {
            match self.store.insert_article(article).await {
                Ok(InsertOutcome::Inserted) => true,
                Ok(InsertOutcome::AlreadyPresent) => {
                    tracing::debug!(url = %article.url, "article already present");
                    true
                }
                Err(error) => {
                    self.relay.exception(
                        "harvest/insert",
                        format!("failed to insert {}", article.url),
                        format!("{error:#}"),
                    );
                    false
                }
            }
        }))
        .await
    }

    async fn enrich(&self, batch: &[ScrapedArticle], completion: &[bool]) -> (StageCount, StageCount) {
        for (article, inserted) in batch.iter().zip(completion) {
            if !inserted {
                tracing::warn!(url = %article.url, "skipping enrichment, insert did not succeed");
            }
        }
        let eligible: Vec<&ScrapedArticle> = batch
            .iter()
            .zip(completion)
            .filter_map(|(article, inserted)| inserted.then_some(article))
            .collect();
        let attempted = eligible.len();

        let (extract_ok, summarize_ok) = match self.settings.strategy {
            SyncStrategy::Sequential => {
                let extracted = join_all(eligible.iter().enumerate().map(|(index, article)| {
                    self.timed(
                        "extract",
                        index + 1,
                        attempted,
                        &article.url,
                        self.extract_and_save(article),
                    )
                }))
                .await;
                let summarized = join_all(eligible.iter().enumerate().map(|(index, article)| {
                    self.timed(
                        "summarize",
                        index + 1,
                        attempted,
                        &article.url,
                        self.summarize_and_save(article),
                    )
                }))
                .await;
                (count_ok(&extracted), count_ok(&summarized))
            }
            SyncStrategy::Dual => {
                let paired = join_all(eligible.iter().enumerate().map(|(index, article)| async move {
                    tokio::join!(
                        self.timed(
                            "extract",
                            index + 1,
                            attempted,
                            &article.url,
                            self.extract_and_save(article),
                        ),
                        self.timed(
                            "summarize",
                            index + 1,
                            attempted,
                            &article.url,
                            self.summarize_and_save(article),
                        )
                    )
                }))
                .await;
                let extract_ok = paired.iter().filter(|(extracted, _)| *extracted).count();
                let summarize_ok = paired.iter().filter(|(_, summarized)| *summarized).count();
                (extract_ok, summarize_ok)
            }
        };

        (
            StageCount {
                attempted,
                succeeded: extract_ok,
            },
            StageCount {
                attempted,
                succeeded: summarize_ok,
            },
        )
    }

    async fn extract_and_save(&self, article: &ScrapedArticle) -> Result<()> {
        let _permit = self.extractor_choker.borrow().await;
        let topics = self.extractor.extract_topics(article).await?;
        let cleaned = keywords::sanitize_topics(topics, &article.url);
        self.store.save_keywords(&article.url, &cleaned).await?;
        Ok(())
    }

    async fn summarize_and_save(&self, article: &ScrapedArticle) -> Result<()> {
        let _permit = self.summarizer_choker.borrow().await;
        let summary = self.summarizer.summarize(article).await?;
        self.store.save_summary(&article.url, &summary).await?;
        Ok(())
    }

    async fn timed<F>(&self, stage: &str, index: usize, total: usize, url: &str, op: F) -> bool
    where
        F: Future<Output = Result<()>>,
    {
        tracing::debug!(stage, index, total, url, "starting");
        let started = std::time::Instant::now();
        match op.await {
            Ok(()) => {
                tracing::debug!(
                    stage,
                    index,
                    total,
                    url,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "finished"
                );
                true
            }
            Err(error) => {
                self.relay.exception(
                    format!("harvest/{stage}"),
                    format!("{stage} failed for {url}"),
                    format!("{error:#}"),
                );
                false
            }
        }
    }
}

fn count_ok(results: &[bool]) -> usize {
    results.iter().filter(|ok| **ok).count()
}

fn far_future() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// The daemon wrapping [`HarvestCore`]: tick-driven scheduling with
/// fire-and-track cycles. While a cycle runs, its "last run" timestamp sits
/// at a far-future sentinel so the next tick cannot re-trigger it; the
/// tracked task dispatches the real completion time back through the
/// daemon's own serializer.
pub struct HarvestConductor {
    core: Arc<HarvestCore>,
    harvest_interval: chrono::Duration,
    gc_interval: chrono::Duration,
    last_harvest: DateTime<Utc>,
    last_gc: DateTime<Utc>,
    previous_cycle_end: DateTime<Utc>,
    handle: Option<DaemonHandle<HarvestConductor>>,
    harvest_task: Option<JoinHandle<()>>,
    gc_task: Option<JoinHandle<()>>,
}

impl HarvestConductor {
    /// Recover timing state from the store, run the startup GC pass and
    /// start the daemon loop.
    pub async fn start(core: Arc<HarvestCore>) -> Result<DaemonHandle<HarvestConductor>> {
        let harvest_interval = chrono::Duration::from_std(core.settings.harvest_interval)
            .context("harvest interval out of range")?;
        let gc_interval = chrono::Duration::from_std(core.settings.gc_interval)
            .context("garbage collection interval out of range")?;

        // An unfinished (crashed) session is deliberately ignored here: only
        // a finished session proves a completed cycle.
        let recovered = match core.store.last_finished_session_end().await {
            Ok(end) => end,
            Err(error) => {
                tracing::warn!(error = %error, "could not recover the last harvest time");
                None
            }
        };
        let last_harvest = recovered.unwrap_or(DateTime::UNIX_EPOCH);

        if let Err(error) = core.run_gc_cycle().await {
            core.relay.exception(
                "gc",
                "startup garbage collection failed",
                format!("{error:#}"),
            );
        }

        let conductor = Self {
            core: Arc::clone(&core),
            harvest_interval,
            gc_interval,
            last_harvest,
            last_gc: Utc::now(),
            previous_cycle_end: last_harvest,
            handle: None,
            harvest_task: None,
            gc_task: None,
        };
        let handle = daemon::spawn(conductor, core.settings.tick_interval);
        let looped = handle.clone();
        let _ = handle
            .dispatch(move |daemon| daemon.handle = Some(looped))
            .await;
        core.relay.message("harvest", "harvest conductor online");
        Ok(handle)
    }

    /// Kick a harvest cycle on the next serializer slot, regardless of the
    /// schedule.
    pub async fn run_harvest_now(
        handle: &DaemonHandle<HarvestConductor>,
    ) -> Result<(), ExecError> {
        handle
            .dispatch(|daemon| {
                daemon.last_harvest = far_future();
                daemon.kick_harvest();
            })
            .await
    }

    /// Kick a garbage-collection cycle on the next serializer slot.
    pub async fn run_gc_now(handle: &DaemonHandle<HarvestConductor>) -> Result<(), ExecError> {
        handle
            .dispatch(|daemon| {
                daemon.last_gc = far_future();
                daemon.kick_gc();
            })
            .await
    }

    fn kick_harvest(&mut self) {
        if self
            .harvest_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            tracing::warn!("harvest cycle already in flight, not starting another");
            return;
        }
        let core = Arc::clone(&self.core);
        let handle = self.handle.clone();
        let previous_end = self.previous_cycle_end;
        let cycle_id = uuid::Uuid::new_v4();
        self.harvest_task = Some(tokio::spawn(async move {
            tracing::info!(%cycle_id, "harvest cycle starting");
            let outcome = AssertUnwindSafe(core.run_harvest_cycle(previous_end))
                .catch_unwind()
                .await;
            let completed = Utc::now();
            let success = match outcome {
                Ok(Ok(report)) => {
                    tracing::info!(
                        %cycle_id,
                        session_id = report.session_id,
                        scraped = report.scraped,
                        inserted = report.inserted,
                        "harvest cycle completed"
                    );
                    true
                }
                Ok(Err(error)) => {
                    core.relay.exception(
                        "harvest",
                        "harvest cycle failed, session left unfinished",
                        format!("{error:#}"),
                    );
                    false
                }
                Err(payload) => {
                    core.relay.exception(
                        "harvest",
                        "harvest cycle panicked",
                        panic_message(payload.as_ref()),
                    );
                    false
                }
            };
            if let Some(handle) = handle {
                let _ = handle
                    .dispatch(move |daemon| daemon.harvest_finished(completed, success))
                    .await;
            }
        }));
    }

    /// End timestamp of the most recent successful cycle; the next session's
    /// provisional end.
    #[must_use]
    pub fn last_cycle_end(&self) -> DateTime<Utc> {
        self.previous_cycle_end
    }

    fn harvest_finished(&mut self, completed: DateTime<Utc>, success: bool) {
        // Advanced even on failure so a broken cycle cannot re-trigger
        // immediately on every tick.
        self.last_harvest = completed;
        if success {
            self.previous_cycle_end = completed;
        }
        self.harvest_task = None;
    }

    fn kick_gc(&mut self) {
        if self.gc_task.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::warn!("garbage collection already in flight, not starting another");
            return;
        }
        let core = Arc::clone(&self.core);
        let handle = self.handle.clone();
        self.gc_task = Some(tokio::spawn(async move {
            if let Err(error) = core.run_gc_cycle().await {
                core.relay
                    .exception("gc", "garbage collection failed", format!("{error:#}"));
            }
            if let Some(handle) = handle {
                let _ = handle.dispatch(HarvestConductor::gc_finished).await;
            }
        }));
    }

    fn gc_finished(&mut self) {
        // Always advanced, success or not.
        self.last_gc = Utc::now();
        self.gc_task = None;
    }
}

#[async_trait]
impl Daemon for HarvestConductor {
    async fn iterate(&mut self) -> bool {
        let now = Utc::now();
        if now - self.last_harvest >= self.harvest_interval {
            self.last_harvest = far_future();
            self.kick_harvest();
        }
        if now - self.last_gc >= self.gc_interval {
            self.last_gc = far_future();
            self.kick_gc();
        }
        true
    }
}
