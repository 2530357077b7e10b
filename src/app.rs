//! Application wiring: build every component once, hand daemons to an
//! explicit registry, tear everything down on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clients::{DelegatedExtractor, DelegatedSummarizer, DelegationConfig};
use crate::conductor::{ConductorSettings, HarvestConductor, HarvestCore};
use crate::config::Config;
use crate::exec::daemon::{DaemonHandle, DaemonRegistry};
use crate::logging::{ConsoleSink, LogRelay, LogSink, PgLogSink};
use crate::scrape::{GenericHtmlOutlet, OutletSet};
use crate::store::harvest::PgHarvestStore;
use crate::store::provider::PgStore;
use crate::store::schema;
use crate::util::retry::RetryConfig;

pub struct ComponentRegistry {
    config: Arc<Config>,
    relay: LogRelay,
    daemons: DaemonRegistry,
    conductor: DaemonHandle<HarvestConductor>,
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// ストレージ初期化、HTTPクライアント構築、アウトレットURLのパースが
    /// 失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store = PgStore::connect_lazy(
            config.db_dsn(),
            config.db_max_connections(),
            config.db_reconnect_attempts(),
        )
        .context("failed to configure the database pool")?;
        schema::initialize(&store)
            .await
            .context("failed to initialize the harvest schema")?;

        let mut sinks: Vec<Box<dyn LogSink>> = vec![Box::new(ConsoleSink)];
        if let Some(table) = config.log_table() {
            let pg_sink = PgLogSink::new(store.clone(), table)
                .context("invalid log table configuration")?;
            pg_sink
                .ensure_table()
                .await
                .context("failed to ensure the log table")?;
            sinks.push(Box::new(pg_sink));
        }
        let relay = LogRelay::new(sinks);

        let retry = RetryConfig::new(
            config.http_max_retries(),
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        );
        let extractor = Arc::new(
            DelegatedExtractor::new(DelegationConfig {
                base_url: config.extractor_base_url().to_string(),
                api_key: config.delegate_api_key().map(ToString::to_string),
                connect_timeout: std::time::Duration::from_secs(10),
                total_timeout: config.delegate_timeout(),
                retry,
            })
            .context("failed to build the extractor client")?,
        );
        let summarizer = Arc::new(
            DelegatedSummarizer::new(DelegationConfig {
                base_url: config.summarizer_base_url().to_string(),
                api_key: config.delegate_api_key().map(ToString::to_string),
                connect_timeout: std::time::Duration::from_secs(10),
                total_timeout: config.delegate_timeout(),
                retry,
            })
            .context("failed to build the summarizer client")?,
        );

        let mut outlets = OutletSet::new();
        for source in config.sources() {
            let outlet = GenericHtmlOutlet::new(
                source,
                config.source_language(),
                config.delegate_timeout(),
            )
            .with_context(|| format!("failed to build outlet for {source}"))?;
            outlets.register(Arc::new(outlet));
        }

        let settings = ConductorSettings {
            harvest_interval: config.harvest_interval(),
            gc_interval: config.gc_interval(),
            retention: config.retention(),
            tick_interval: config.tick_interval(),
            scrape_limit: config.scrape_limit(),
            strategy: config.sync_strategy(),
            extractor_cap: config.extractor_cap(),
            summarizer_cap: config.summarizer_cap(),
        };
        let core = Arc::new(HarvestCore::new(
            Arc::new(PgHarvestStore::new(store)),
            outlets,
            extractor,
            summarizer,
            relay.clone(),
            settings,
        ));

        let conductor = HarvestConductor::start(core)
            .await
            .context("failed to start the harvest conductor")?;
        let daemons = DaemonRegistry::new();
        daemons.manage("conductor", Box::new(conductor.clone()));

        Ok(Self {
            config,
            relay,
            daemons,
            conductor,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn conductor(&self) -> &DaemonHandle<HarvestConductor> {
        &self.conductor
    }

    /// Close every daemon, then drain the log relay.
    pub async fn shutdown(&self) {
        self.daemons.close_all().await;
        self.relay.message("app", "all daemons closed");
        self.relay.close().await;
    }
}
