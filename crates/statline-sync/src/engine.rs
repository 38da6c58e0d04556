//! Fan-out / fan-in execution of one scoped run: a tier of page-walking
//! producers feeding a bounded channel drained by a pool of reconcilers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use statline_adapters::EntityAdapter;
use statline_core::{Clock, Target};
use statline_storage::{EntityStore, RateGate, UpstreamClient};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn, Instrument};
use uuid::Uuid;

use crate::fetch::{PageCursor, PaginatedFetcher};
use crate::reconcile::{Outcome, Reconciler};
use crate::{EngineTuning, RunSummary, SyncError};

/// Everything a run shares across its tasks. Owned per run, except the rate
/// gate which the dispatcher hands to every run of the process.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub command: String,
    pub gate: Arc<RateGate>,
    pub clock: Arc<dyn Clock>,
    pub tuning: EngineTuning,
}

impl RunContext {
    pub fn new(
        command: impl Into<String>,
        gate: Arc<RateGate>,
        clock: Arc<dyn Clock>,
        tuning: EngineTuning,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            command: command.into(),
            gate,
            clock,
            tuning: tuning.normalized(),
        }
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    pages: AtomicU64,
    fetched: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    failed: AtomicU64,
    truncated: AtomicBool,
}

impl RunCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct SyncEngine<A: EntityAdapter> {
    adapter: Arc<A>,
    store: Arc<dyn EntityStore<A::Record>>,
    client: Arc<dyn UpstreamClient>,
}

impl<A: EntityAdapter> SyncEngine<A> {
    pub fn new(
        adapter: A,
        store: Arc<dyn EntityStore<A::Record>>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            adapter: Arc::new(adapter),
            store,
            client,
        }
    }

    /// Fetch every target and reconcile every record, returning once all
    /// reconcilers have finished. The first upstream failure cancels the
    /// remaining fetches; records already queued are still reconciled.
    pub async fn run(
        &self,
        targets: Vec<Target>,
        ctx: &RunContext,
    ) -> Result<RunSummary, SyncError> {
        let started_at = ctx.clock.now();
        let tuning = ctx.tuning.normalized();
        let target_count = targets.len();
        let counters = Arc::new(RunCounters::default());
        let (tx, rx) = mpsc::channel::<A::Upstream>(tuning.channel_capacity);

        let workers = self.spawn_reconcilers(rx, ctx, &counters);
        let fetch_failure = self.fetch_all(targets, tx, ctx, &counters).await;
        let worker_failure = join_workers(workers).await;

        if let Some(err) = fetch_failure.or(worker_failure) {
            return Err(err);
        }

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let summary = RunSummary {
            run_id: ctx.run_id,
            command: ctx.command.clone(),
            entity: self.adapter.kind(),
            targets: target_count,
            pages: load(&counters.pages),
            fetched: load(&counters.fetched),
            created: load(&counters.created),
            updated: load(&counters.updated),
            failed: load(&counters.failed),
            truncated: counters.truncated.load(Ordering::Relaxed),
            started_at,
            finished_at: ctx.clock.now(),
        };
        debug!(?summary, "engine run finished");
        Ok(summary)
    }

    fn spawn_reconcilers(
        &self,
        rx: mpsc::Receiver<A::Upstream>,
        ctx: &RunContext,
        counters: &Arc<RunCounters>,
    ) -> JoinSet<()> {
        let reconciler = Arc::new(Reconciler::new(
            self.adapter.clone(),
            self.store.clone(),
            ctx.clock.clone(),
            ctx.tuning.lock_shards,
        ));
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..ctx.tuning.reconcile_workers.max(1) {
            workers.spawn(
                reconcile_from(reconciler.clone(), rx.clone(), counters.clone()).in_current_span(),
            );
        }
        workers
    }

    /// Returns the first fatal error, if any.
    async fn fetch_all(
        &self,
        targets: Vec<Target>,
        tx: mpsc::Sender<A::Upstream>,
        ctx: &RunContext,
        counters: &Arc<RunCounters>,
    ) -> Option<SyncError> {
        let fetcher = PaginatedFetcher::new(self.client.clone(), ctx.gate.clone());
        let producers = ctx.tuning.fetch_concurrency.max(1).min(targets.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(targets)));

        let mut tasks = JoinSet::new();
        for _ in 0..producers {
            tasks.spawn(
                fetch_from(
                    self.adapter.clone(),
                    fetcher.clone(),
                    queue.clone(),
                    tx.clone(),
                    counters.clone(),
                )
                .in_current_span(),
            );
        }
        // Producers hold the only remaining senders; the channel closes when
        // the last of them finishes.
        drop(tx);

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            if fatal.is_some() {
                continue;
            }
            if let Err(err) = joined.map_err(SyncError::from).and_then(|r| r) {
                error!(error = %err, "fetch failed; cancelling remaining fetches");
                tasks.abort_all();
                fatal = Some(err);
            }
        }
        fatal
    }
}

async fn fetch_from<A: EntityAdapter>(
    adapter: Arc<A>,
    fetcher: PaginatedFetcher,
    queue: Arc<Mutex<VecDeque<Target>>>,
    tx: mpsc::Sender<A::Upstream>,
    counters: Arc<RunCounters>,
) -> Result<(), SyncError> {
    loop {
        let next = queue.lock().await.pop_front();
        let Some(target) = next else {
            return Ok(());
        };
        if !walk_target(adapter.as_ref(), &fetcher, target, &tx, &counters).await? {
            return Ok(());
        }
    }
}

/// Walk every page of one target, pushing decoded records into the channel.
/// Returns `false` when the producer should stop taking targets: the channel
/// has no receivers left or the rate gate is exhausted.
async fn walk_target<A: EntityAdapter>(
    adapter: &A,
    fetcher: &PaginatedFetcher,
    target: Target,
    tx: &mpsc::Sender<A::Upstream>,
    counters: &RunCounters,
) -> Result<bool, SyncError> {
    let mut cursor = PageCursor::new(adapter.endpoint(&target)?, adapter.includes());

    while let Some(page) = fetcher.next_page(&mut cursor).await? {
        RunCounters::bump(&counters.pages);
        for item in page.items {
            for decoded in adapter.explode(&target, item) {
                match decoded {
                    Ok(upstream) => {
                        RunCounters::bump(&counters.fetched);
                        if tx.send(upstream).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Err(err) => {
                        RunCounters::bump(&counters.failed);
                        warn!(
                            entity = %adapter.kind(),
                            %target,
                            error = %err,
                            "skipping malformed upstream item"
                        );
                    }
                }
            }
        }
    }

    if cursor.truncated() {
        counters.truncated.store(true, Ordering::Relaxed);
        return Ok(false);
    }
    Ok(true)
}

async fn reconcile_from<A: EntityAdapter>(
    reconciler: Arc<Reconciler<A>>,
    rx: Arc<Mutex<mpsc::Receiver<A::Upstream>>>,
    counters: Arc<RunCounters>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(upstream) = next else {
            break;
        };
        match reconciler.reconcile(&upstream).await {
            Ok(Outcome::Created) => RunCounters::bump(&counters.created),
            Ok(Outcome::Updated) => RunCounters::bump(&counters.updated),
            Err(err) => {
                RunCounters::bump(&counters.failed);
                warn!(
                    key = err.key(),
                    payload = ?upstream,
                    error = %err,
                    "reconcile failed; continuing with remaining records"
                );
            }
        }
    }
}

/// Fan-in barrier: waits for every reconciler to exit.
async fn join_workers(mut workers: JoinSet<()>) -> Option<SyncError> {
    let mut failure = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "reconcile worker died");
            failure.get_or_insert(SyncError::Task(err));
        }
    }
    failure
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use statline_adapters::CountryAdapter;
    use statline_core::{Country, FixedClock};
    use statline_storage::{ApiPage, FetchError, MemoryStore};

    /// Serves a single country per path and counts requests.
    #[derive(Default)]
    struct OneCountry {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for OneCountry {
        async fn fetch_page(
            &self,
            _path: &str,
            _includes: &[&str],
            _page: u32,
        ) -> Result<ApiPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ApiPage::single(vec![
                serde_json::json!({"id": 32, "name": "Italy"}),
            ]))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl UpstreamClient for Unreachable {
        async fn fetch_page(
            &self,
            path: &str,
            _includes: &[&str],
            _page: u32,
        ) -> Result<ApiPage, FetchError> {
            panic!("no fetch expected, got {path}");
        }
    }

    #[tokio::test]
    async fn empty_scope_completes_immediately() {
        let store = Arc::new(MemoryStore::<Country>::new());
        let engine =
            SyncEngine::<CountryAdapter>::new(CountryAdapter, store.clone(), Arc::new(Unreachable));
        let ctx = RunContext::new(
            "country",
            Arc::new(RateGate::new(1)),
            Arc::new(FixedClock::new(Utc::now())),
            EngineTuning::default(),
        );
        let summary = engine.run(Vec::new(), &ctx).await.unwrap();
        assert_eq!(summary.targets, 0);
        assert_eq!(summary.pages, 0);
        assert_eq!(summary.created, 0);
        assert!(!summary.truncated);
        assert_eq!(ctx.gate.remaining(), 1);
    }

    #[tokio::test]
    async fn exhausted_gate_stops_the_producer() {
        let upstream = Arc::new(OneCountry::default());
        let fetcher = PaginatedFetcher::new(upstream.clone(), Arc::new(RateGate::new(1)));
        let counters = RunCounters::default();
        let (tx, mut rx) = mpsc::channel(4);

        let keep_going =
            walk_target(&CountryAdapter, &fetcher, Target::Collection, &tx, &counters).await;
        assert!(keep_going.unwrap());
        assert!(rx.recv().await.is_some());

        let keep_going =
            walk_target(&CountryAdapter, &fetcher, Target::Collection, &tx, &counters).await;
        assert!(!keep_going.unwrap());
        assert!(counters.truncated.load(Ordering::Relaxed));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.pages.load(Ordering::Relaxed), 1);
    }
}
