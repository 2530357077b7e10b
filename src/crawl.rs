//! Reference crawler: a breadth-limited walk over a link graph driven by
//! the shared worker pool.
//!
//! Every crawled node enqueues its newly discovered neighbors as further
//! pool tasks, so the batch grows while it drains; completion is detected by
//! the pool's idle barrier (no worker active, nothing queued). Discovered
//! edges optionally stream into a serialized pool of ledger handles.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::exec::pool::WorkerPool;
use crate::exec::resource::SerialPool;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Where the crawler asks for outgoing references of one node.
#[async_trait]
pub trait LinkSource: Send + Sync + 'static {
    async fn referenced_ids(&self, id: i64) -> Result<Vec<i64>>;
}

/// Durable edge sink handle; instances are pooled and reused.
pub trait EdgeLedger: Send {
    fn record(&mut self, from: i64, to: i64);
}

#[derive(Default)]
struct MapInner {
    edges: HashSet<(i64, i64)>,
    visited: HashSet<i64>,
}

/// Shared dedup state: which edges exist, which nodes were already claimed
/// for crawling. Claiming is atomic with edge recording so a node is
/// enqueued exactly once no matter how many workers discover it.
#[derive(Default)]
pub struct ReferenceMap {
    inner: Mutex<MapInner>,
}

impl ReferenceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-claim a node (used for seeds) so discovery will not re-enqueue it.
    pub fn mark_visited(&self, id: i64) -> bool {
        self.inner.lock().unwrap().visited.insert(id)
    }

    /// Record the edge and claim the target; true when the target is new.
    pub fn try_reference(&self, from: i64, to: i64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.edges.insert((from, to));
        inner.visited.insert(to)
    }

    #[must_use]
    pub fn edges(&self) -> Vec<(i64, i64)> {
        self.inner.lock().unwrap().edges.iter().copied().collect()
    }

    #[must_use]
    pub fn visited_count(&self) -> usize {
        self.inner.lock().unwrap().visited.len()
    }
}

pub struct ReferenceCrawler<S: LinkSource> {
    source: Arc<S>,
    workers: WorkerPool,
    map: Arc<ReferenceMap>,
    ledger: Option<Arc<SerialPool<Box<dyn EdgeLedger>>>>,
}

impl<S: LinkSource> ReferenceCrawler<S> {
    #[must_use]
    pub fn new(source: Arc<S>, worker_count: usize) -> Self {
        Self {
            source,
            workers: WorkerPool::new(worker_count),
            map: Arc::new(ReferenceMap::new()),
            ledger: None,
        }
    }

    /// One worker per available core, at least two.
    #[must_use]
    pub fn with_cpu_workers(source: Arc<S>) -> Self {
        Self::new(source, num_cpus::get().max(2))
    }

    /// Stream every discovered edge into pooled ledger handles as well.
    #[must_use]
    pub fn with_ledger(mut self, ledger: SerialPool<Box<dyn EdgeLedger>>) -> Self {
        self.ledger = Some(Arc::new(ledger));
        self
    }

    /// Walk up to `depth` hops out from the seeds and return the edge set.
    pub async fn crawl(&self, seeds: &[i64], depth: u32) -> Vec<(i64, i64)> {
        for seed in seeds {
            self.map.mark_visited(*seed);
        }
        for seed in seeds {
            let _ = self.workers.enqueue(crawl_step(
                Arc::clone(&self.source),
                self.workers.clone(),
                Arc::clone(&self.map),
                self.ledger.clone(),
                *seed,
                depth,
            ));
        }

        // Idle barrier: tasks keep enqueueing tasks, so "done" is the pool
        // going quiet, not a fixed handle count.
        loop {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            if self.workers.is_idle() {
                break;
            }
        }
        self.map.edges()
    }

    #[must_use]
    pub fn map(&self) -> &ReferenceMap {
        &self.map
    }

    /// Tear down the worker pool; the crawler is unusable afterwards.
    pub async fn shutdown(&self) {
        self.workers.stop_all(true).await;
        if let Some(ledger) = &self.ledger {
            ledger.close().await;
        }
    }
}

fn crawl_step<S: LinkSource>(
    source: Arc<S>,
    workers: WorkerPool,
    map: Arc<ReferenceMap>,
    ledger: Option<Arc<SerialPool<Box<dyn EdgeLedger>>>>,
    id: i64,
    remaining_depth: u32,
) -> BoxFuture<'static, ()> {
    async move {
        let referenced = match source.referenced_ids(id).await {
            Ok(referenced) => referenced,
            Err(error) => {
                tracing::warn!(id, error = %error, "reference lookup failed");
                return;
            }
        };
        for target in referenced {
            let newly_claimed = map.try_reference(id, target);
            if let Some(pool) = &ledger {
                if let Ok(mut handle) = pool.borrow().await {
                    handle.record(id, target);
                }
            }
            if newly_claimed && remaining_depth > 0 {
                let _ = workers.enqueue(crawl_step(
                    Arc::clone(&source),
                    workers.clone(),
                    Arc::clone(&map),
                    ledger.clone(),
                    target,
                    remaining_depth - 1,
                ));
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::rank;

    struct FixedGraph {
        links: HashMap<i64, Vec<i64>>,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl LinkSource for FixedGraph {
        async fn referenced_ids(&self, id: i64) -> Result<Vec<i64>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.links.get(&id).cloned().unwrap_or_default())
        }
    }

    fn diamond() -> FixedGraph {
        // 1 -> {2, 3}, 2 -> 4, 3 -> 4, 4 -> nothing.
        FixedGraph {
            links: HashMap::from([(1, vec![2, 3]), (2, vec![4]), (3, vec![4])]),
            lookups: AtomicUsize::new(0),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crawl_discovers_every_edge_and_visits_nodes_once() {
        let graph = Arc::new(diamond());
        let crawler = ReferenceCrawler::new(Arc::clone(&graph), 3);

        let mut edges = crawler.crawl(&[1], 5).await;
        edges.sort_unstable();
        assert_eq!(edges, vec![(1, 2), (1, 3), (2, 4), (3, 4)]);
        assert_eq!(crawler.map().visited_count(), 4);
        // The diamond's shared sink is looked up once, not per inbound edge.
        assert_eq!(graph.lookups.load(Ordering::SeqCst), 4);

        crawler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn depth_limit_stops_the_walk() {
        let graph = Arc::new(diamond());
        let crawler = ReferenceCrawler::new(graph, 2);

        let mut edges = crawler.crawl(&[1], 0).await;
        edges.sort_unstable();
        // Depth zero crawls only the seed itself.
        assert_eq!(edges, vec![(1, 2), (1, 3)]);

        crawler.shutdown().await;
    }

    struct SharedLedger {
        sink: Arc<Mutex<Vec<(i64, i64)>>>,
    }

    impl EdgeLedger for SharedLedger {
        fn record(&mut self, from: i64, to: i64) {
            self.sink.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ledger_receives_every_discovered_edge() {
        let graph = Arc::new(diamond());
        let sink = Arc::new(Mutex::new(Vec::new()));
        let spawner_sink = Arc::clone(&sink);
        let ledger: SerialPool<Box<dyn EdgeLedger>> = SerialPool::new(move || {
            Box::new(SharedLedger {
                sink: Arc::clone(&spawner_sink),
            }) as Box<dyn EdgeLedger>
        });
        let crawler = ReferenceCrawler::new(graph, 2).with_ledger(ledger);

        let edges = crawler.crawl(&[1], 5).await;
        crawler.shutdown().await;

        let mut recorded = sink.lock().unwrap().clone();
        recorded.sort_unstable();
        let mut discovered = edges;
        discovered.sort_unstable();
        assert_eq!(recorded, discovered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crawl_feeds_the_page_rank_pipeline() {
        let graph = Arc::new(FixedGraph {
            links: HashMap::from([(1, vec![3]), (2, vec![3]), (3, vec![1])]),
            lookups: AtomicUsize::new(0),
        });
        let crawler = ReferenceCrawler::new(graph, 2);
        let edges = crawler.crawl(&[1, 2], 4).await;
        crawler.shutdown().await;

        let (matrix, nodes) = rank::adjacency_from_edges(&edges);
        let ranks = rank::page_rank(&matrix, 100, 0.85);
        let hub = nodes.iter().position(|id| *id == 3).expect("hub found");
        for position in 0..nodes.len() {
            if position != hub {
                assert!(ranks[hub] > ranks[position]);
            }
        }
    }
}
