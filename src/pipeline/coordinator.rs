//! Pipeline coordinator
//!
//! Wires the frontier, the provider clients, the analyzer, and the store
//! writer into a staged dataflow:
//!
//! ```text
//! seeds ─► [discover] ─Qa─► [fetch] ─Qb─► [analyze] ─Qc─► [persist]
//!              ▲               │
//!              └── neighbors ──┘
//! ```
//!
//! Queues are bounded, so slow persistence throttles analysis, which
//! throttles discovery; rate limits are enforced below, in the clients.
//! One failing item never stops the pipeline: per-item errors are
//! counted and the item dropped. Store schema mismatches and sustained
//! provider outages are fatal and move the run to `Failed`.

use crate::analyze::Analyzer;
use crate::cancel::CancellationToken;
use crate::client::{
    AnalysisProvider, CitationRef, ErrorCounters, MetadataProvider, ProviderError,
};
use crate::config::RunConfig;
use crate::model::{Paper, PaperId};
use crate::pipeline::checkpoint::{Checkpoint, CheckpointError};
use crate::pipeline::frontier::Frontier;
use crate::pipeline::status::{Counters, RunState, StatusSnapshot};
use crate::store::{StoreError, StoreWriter, WriteOp};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How often blocked workers re-check cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Consecutive transient provider failures before the run is declared dead.
const FATAL_PROVIDER_THRESHOLD: usize = 20;
/// Attempts against a busy store before giving up on the run.
const STORE_BUSY_ATTEMPTS: u32 = 4;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("a run is already active")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("resume requested but no checkpoint path is configured")]
    NoCheckpointPath,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What `stop()` found to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopNote {
    /// An active run was cancelled and has quiesced.
    Stopped,
    /// No run was active; stop is idempotent.
    AlreadyStopped,
}

/// A metadata-resolved paper flowing from fetch to analyze.
struct FetchedPaper {
    paper: Paper,
    depth: u32,
    references: Vec<CitationRef>,
    /// Incoming citation sources, when citation expansion is on.
    citing: Vec<PaperId>,
}

/// An enrichment flowing from analyze to persist.
struct AnalyzedPaper {
    enrichment: crate::analyze::Enrichment,
    citing: Vec<PaperId>,
}

/// Everything one run's workers share.
struct RunContext {
    config: RunConfig,
    frontier: Frontier,
    metadata: Arc<dyn MetadataProvider>,
    analyzer: Analyzer,
    writer: Arc<StoreWriter>,
    counters: Arc<Counters>,
    errors: Arc<ErrorCounters>,
    cancel: CancellationToken,
    /// Items claimed from the frontier but not yet persisted or dropped.
    in_flight: AtomicUsize,
    in_flight_ids: DashMap<PaperId, u32>,
    fatal: Mutex<Option<String>>,
    exhausted: AtomicBool,
    /// Consecutive post-retry transient failures, tracked per provider
    /// so a healthy metadata source cannot mask a dead analysis one.
    metadata_outage: AtomicUsize,
    analysis_outage: AtomicUsize,
    checkpointer: Option<Checkpointer>,
}

impl RunContext {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn declare_fatal(&self, reason: String) {
        tracing::error!(reason = %reason, "run failed");
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(reason);
        }
        self.cancel.cancel();
    }

    fn note_outage(&self, counter: &AtomicUsize, provider: &'static str) {
        let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= FATAL_PROVIDER_THRESHOLD {
            self.declare_fatal(format!(
                "{} consecutive {} provider failures beyond retries",
                n, provider
            ));
        }
    }

    fn note_metadata_failure(&self) {
        self.note_outage(&self.metadata_outage, "metadata");
    }

    fn note_metadata_success(&self) {
        self.metadata_outage.store(0, Ordering::Relaxed);
    }

    fn note_analysis_failure(&self) {
        self.note_outage(&self.analysis_outage, "analysis");
    }

    fn note_analysis_success(&self) {
        self.analysis_outage.store(0, Ordering::Relaxed);
    }

    /// Remove a finished (persisted or dropped) item from the in-flight
    /// accounting.
    fn finish_item(&self, id: &PaperId) {
        self.in_flight_ids.remove(id);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Pending (id, depth) pairs: items inside the stages first, then the
    /// frontier queue.
    fn resumable_queue(&self) -> Vec<(PaperId, u32)> {
        let mut in_flight: Vec<(PaperId, u32)> = self
            .in_flight_ids
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        in_flight.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        in_flight.extend(self.frontier.snapshot_queue());
        in_flight
    }
}

/// Writes a checkpoint every N discovered items, and once at shutdown.
struct Checkpointer {
    path: PathBuf,
    every_n: usize,
    run_id: String,
    config: RunConfig,
    since_last: AtomicUsize,
    write_lock: Mutex<()>,
}

impl Checkpointer {
    fn note_discovered(&self, n: usize, ctx: &RunContext) {
        if n == 0 {
            return;
        }
        let total = self.since_last.fetch_add(n, Ordering::SeqCst) + n;
        if total >= self.every_n {
            self.since_last.store(0, Ordering::SeqCst);
            self.write(ctx);
        }
    }

    fn write(&self, ctx: &RunContext) {
        let _guard = self.write_lock.lock().unwrap();
        let checkpoint = Checkpoint::new(
            self.run_id.clone(),
            self.config.clone(),
            ctx.resumable_queue(),
        );
        if let Err(err) = checkpoint.write_atomic(&self.path) {
            tracing::warn!(error = %err, "checkpoint write failed");
        } else {
            tracing::debug!(queue = checkpoint.queue.len(), "checkpoint written");
        }
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    handle: JoinHandle<RunState>,
}

/// Run-control surface over the staged pipeline. One instance owns the
/// provider handles and store writer; runs are started, stopped, and
/// observed through it.
pub struct PipelineCoordinator {
    metadata: Arc<dyn MetadataProvider>,
    analysis: Arc<dyn AnalysisProvider>,
    writer: Arc<StoreWriter>,
    errors: Arc<ErrorCounters>,
    checkpoint_path: Option<PathBuf>,
    state: Arc<Mutex<RunState>>,
    counters: Mutex<Arc<Counters>>,
    max_papers_hint: Mutex<Option<usize>>,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl PipelineCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        analysis: Arc<dyn AnalysisProvider>,
        writer: Arc<StoreWriter>,
        errors: Arc<ErrorCounters>,
        checkpoint_path: Option<PathBuf>,
    ) -> Self {
        Self {
            metadata,
            analysis,
            writer,
            errors,
            checkpoint_path,
            state: Arc::new(Mutex::new(RunState::Idle)),
            counters: Mutex::new(Arc::new(Counters::new())),
            max_papers_hint: Mutex::new(None),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Start a run. Rejects if one is already active.
    pub async fn start(&self, config: RunConfig) -> Result<(), CoordinatorError> {
        config.validate().map_err(CoordinatorError::InvalidConfig)?;

        let mut active = self.active.lock().await;
        if self.state.lock().unwrap().is_active() {
            return Err(CoordinatorError::AlreadyRunning);
        }
        // A previous run's finished handle may still occupy the slot.
        active.take();

        *self.state.lock().unwrap() = RunState::Starting;
        let counters = Arc::new(Counters::new());
        counters.mark_started();
        *self.counters.lock().unwrap() = counters.clone();
        *self.max_papers_hint.lock().unwrap() = config.max_papers;

        let run_id = Uuid::new_v4().to_string();
        match self.prepare_run(&config, run_id.clone(), counters).await {
            Ok(ctx) => {
                let ctx = Arc::new(ctx);
                let cancel = ctx.cancel.clone();
                let state = self.state.clone();
                *state.lock().unwrap() = RunState::Running;
                tracing::info!(
                    run_id = %run_id,
                    seeds = ctx.config.seeds.len(),
                    max_depth = ctx.config.max_depth,
                    "run started"
                );

                let handle = tokio::spawn(async move {
                    let final_state = run_pipeline(ctx).await;
                    *state.lock().unwrap() = final_state;
                    final_state
                });
                *active = Some(ActiveRun { cancel, handle });
                Ok(())
            }
            Err(err) => {
                *self.state.lock().unwrap() = RunState::Failed;
                Err(err)
            }
        }
    }

    /// Build the frontier and shared context, restoring resume state.
    async fn prepare_run(
        &self,
        config: &RunConfig,
        run_id: String,
        counters: Arc<Counters>,
    ) -> Result<RunContext, CoordinatorError> {
        let frontier = Frontier::new(
            config.max_depth,
            config.max_papers,
            config.max_fanout_per_paper,
        );

        if config.resume {
            let path = self
                .checkpoint_path
                .as_ref()
                .ok_or(CoordinatorError::NoCheckpointPath)?;
            let checkpoint = Checkpoint::load(path)?;
            // Queue entries claim first: a stub persisted for an edge
            // endpoint must not block its own pending fetch. Everything
            // else the store knows is marked done.
            let restored = frontier.restore(checkpoint.queue);
            frontier.seed_visited(self.writer.graph().paper_ids()?);
            counters.add_discovered(restored as u64);
            tracing::info!(restored, "frontier restored from checkpoint");
        }

        let claimed = frontier.seed(&config.seeds);
        counters.add_discovered(claimed as u64);

        // The vector collection is bound to one embedding model; a
        // changed model forces a re-embed of everything.
        let embed_model = self.analysis.embedding_model_id().to_string();
        match self.writer.vector().ensure_model(&embed_model)? {
            crate::store::ModelCheck::Mismatch { stored } => {
                tracing::warn!(
                    stored = %stored,
                    configured = %embed_model,
                    "embedding model changed; resetting vector collection"
                );
                self.writer.vector().reset_collection(&embed_model)?;
                for id in self.writer.graph().paper_ids()? {
                    self.writer.graph().mark_embedding_pending(&id, true)?;
                }
            }
            _ => {}
        }

        let analyzer = Analyzer::new(self.analysis.clone())
            .with_flags(config.analyze_enabled, config.embed_enabled);

        let checkpointer = self.checkpoint_path.as_ref().map(|path| Checkpointer {
            path: path.clone(),
            every_n: config.checkpoint_every_n,
            run_id,
            config: config.clone(),
            since_last: AtomicUsize::new(0),
            write_lock: Mutex::new(()),
        });

        Ok(RunContext {
            config: config.clone(),
            frontier,
            metadata: self.metadata.clone(),
            analyzer,
            writer: self.writer.clone(),
            counters,
            errors: self.errors.clone(),
            cancel: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            in_flight_ids: DashMap::new(),
            fatal: Mutex::new(None),
            exhausted: AtomicBool::new(false),
            metadata_outage: AtomicUsize::new(0),
            analysis_outage: AtomicUsize::new(0),
            checkpointer,
        })
    }

    /// Request cooperative cancellation and wait until the run quiesces.
    /// Idempotent: stopping a non-running coordinator succeeds with a note.
    pub async fn stop(&self) -> Result<StopNote, CoordinatorError> {
        let mut active = self.active.lock().await;
        let run = match active.take() {
            Some(run) => run,
            None => return Ok(StopNote::AlreadyStopped),
        };

        {
            let mut state = self.state.lock().unwrap();
            if state.is_active() {
                *state = RunState::Stopping;
            }
        }
        run.cancel.cancel();
        match run.handle.await {
            Ok(_) => Ok(StopNote::Stopped),
            Err(join_err) => {
                tracing::error!(error = %join_err, "run task panicked");
                *self.state.lock().unwrap() = RunState::Failed;
                Ok(StopNote::Stopped)
            }
        }
    }

    /// Wait for the run to reach a terminal state without cancelling it.
    pub async fn wait(&self) -> RunState {
        let run = { self.active.lock().await.take() };
        if let Some(run) = run {
            return run.handle.await.unwrap_or(RunState::Failed);
        }
        // Another caller holds the handle (e.g. a concurrent stop);
        // follow the shared state instead.
        loop {
            let state = *self.state.lock().unwrap();
            if !state.is_active() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Progress snapshot of the current (or last) run.
    pub fn status(&self) -> StatusSnapshot {
        let state = *self.state.lock().unwrap();
        let counters = self.counters.lock().unwrap().clone();
        let max_papers = *self.max_papers_hint.lock().unwrap();
        StatusSnapshot::capture(state, &counters, &self.errors, max_papers)
    }

    /// Re-embed papers whose vector write was deferred. Returns how many
    /// embeddings were filled.
    pub async fn backfill_embeddings(&self) -> Result<usize, CoordinatorError> {
        let cancel = CancellationToken::new();
        let pending = self.writer.pending_embeddings()?;
        let mut filled = 0;
        for id in pending {
            let paper = match self.writer.graph().get_paper(&id)? {
                Some(p) => p,
                None => continue,
            };
            let text = match paper.embed_text() {
                Some(t) => t,
                None => continue,
            };
            match self.analysis.embed(&text, &cancel).await {
                Ok(embedding) => {
                    self.writer.fill_embedding(&paper, embedding)?;
                    filled += 1;
                }
                Err(err) => {
                    self.errors.record("backfill", err.kind());
                    tracing::warn!(paper = %id, error = %err, "backfill embed failed");
                }
            }
        }
        Ok(filled)
    }
}

// ---------------------------------------------------------------------------
// Stage workers
// ---------------------------------------------------------------------------

/// Send through a bounded channel without losing the item: reserve a
/// slot under a timeout so cancellation stays observable. Returns the
/// item back if the send was abandoned.
async fn send_bounded<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> Result<(), T> {
    loop {
        if cancel.is_cancelled() {
            return Err(item);
        }
        match tokio::time::timeout(POLL_INTERVAL, tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(item);
                return Ok(());
            }
            Ok(Err(_closed)) => return Err(item),
            Err(_elapsed) => continue,
        }
    }
}

/// Receive from a shared bounded channel, polling cancellation. `None`
/// means the stage should exit (cancelled or upstream closed).
async fn recv_bounded<T>(
    rx: &tokio::sync::Mutex<mpsc::Receiver<T>>,
    cancel: &CancellationToken,
) -> Option<T> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        let mut guard = rx.lock().await;
        match tokio::time::timeout(POLL_INTERVAL, guard.recv()).await {
            Ok(item) => return item,
            Err(_elapsed) => continue,
        }
    }
}

/// Supervise one run to its terminal state.
async fn run_pipeline(ctx: Arc<RunContext>) -> RunState {
    let queues = ctx.config.queues;
    let (qa_tx, qa_rx) = mpsc::channel::<(PaperId, u32)>(queues.discovered);
    let (qb_tx, qb_rx) = mpsc::channel::<FetchedPaper>(queues.fetched);
    let (qc_tx, qc_rx) = mpsc::channel::<AnalyzedPaper>(queues.analyzed);
    let qa_rx = Arc::new(tokio::sync::Mutex::new(qa_rx));
    let qb_rx = Arc::new(tokio::sync::Mutex::new(qb_rx));
    let qc_rx = Arc::new(tokio::sync::Mutex::new(qc_rx));

    let mut handles = Vec::new();

    for _ in 0..ctx.config.workers.discover {
        let ctx = ctx.clone();
        let qa_tx = qa_tx.clone();
        handles.push(tokio::spawn(discover_worker(ctx, qa_tx)));
    }
    drop(qa_tx);

    for _ in 0..ctx.config.workers.fetch {
        let ctx = ctx.clone();
        let qa_rx = qa_rx.clone();
        let qb_tx = qb_tx.clone();
        handles.push(tokio::spawn(fetch_worker(ctx, qa_rx, qb_tx)));
    }
    drop(qb_tx);

    for _ in 0..ctx.config.workers.analyze {
        let ctx = ctx.clone();
        let qb_rx = qb_rx.clone();
        let qc_tx = qc_tx.clone();
        handles.push(tokio::spawn(analyze_worker(ctx, qb_rx, qc_tx)));
    }
    drop(qc_tx);

    for _ in 0..ctx.config.workers.persist {
        let ctx = ctx.clone();
        let qc_rx = qc_rx.clone();
        handles.push(tokio::spawn(persist_worker(ctx, qc_rx)));
    }

    for handle in handles {
        if let Err(join_err) = handle.await {
            ctx.declare_fatal(format!("stage worker panicked: {}", join_err));
        }
    }

    // Final checkpoint so a stop or failure resumes where it left off.
    if let Some(checkpointer) = &ctx.checkpointer {
        checkpointer.write(&ctx);
    }

    let final_state = if ctx.fatal.lock().unwrap().is_some() {
        RunState::Failed
    } else if ctx.exhausted.load(Ordering::SeqCst) && !ctx.cancel.is_cancelled() {
        RunState::Completed
    } else {
        RunState::Stopped
    };

    tracing::info!(
        state = ?final_state,
        discovered = ctx.counters.discovered.load(Ordering::Relaxed),
        persisted = ctx.counters.persisted.load(Ordering::Relaxed),
        "run finished"
    );
    final_state
}

/// Stage A: pump the frontier into Qa, tracking in-flight items. Exits
/// when the frontier is empty and nothing is in flight (exhausted), or
/// on cancellation.
async fn discover_worker(ctx: Arc<RunContext>, qa_tx: mpsc::Sender<(PaperId, u32)>) {
    loop {
        if ctx.should_stop() {
            return;
        }
        match ctx.frontier.next() {
            Some((id, depth)) => {
                ctx.in_flight.fetch_add(1, Ordering::SeqCst);
                ctx.in_flight_ids.insert(id.clone(), depth);
                if send_bounded(&qa_tx, (id, depth), &ctx.cancel).await.is_err() {
                    // Abandoned item stays in the in-flight map for the
                    // final checkpoint.
                    return;
                }
            }
            None => {
                if ctx.in_flight.load(Ordering::SeqCst) == 0 {
                    ctx.exhausted.store(true, Ordering::SeqCst);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}

/// Stage B: resolve metadata, feed neighbors back to the frontier, and
/// hand the paper to analysis.
async fn fetch_worker(
    ctx: Arc<RunContext>,
    qa_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<(PaperId, u32)>>>,
    qb_tx: mpsc::Sender<FetchedPaper>,
) {
    while let Some((id, depth)) = recv_bounded(&qa_rx, &ctx.cancel).await {
        let paper = if ctx.config.use_metadata {
            match ctx.metadata.get_paper(&id, &ctx.cancel).await {
                Ok(record) => {
                    ctx.note_metadata_success();
                    record.into_paper()
                }
                Err(ProviderError::Cancelled) => return,
                Err(ProviderError::NotFound(_)) => {
                    // Unresolvable: keep a stub node, never requeue.
                    if let Err(err) = ctx.writer.graph().ensure_stub(&id) {
                        ctx.errors.record("fetch", err.kind());
                    }
                    ctx.errors.record("fetch", "not_found");
                    tracing::warn!(paper = %id, "paper not found; stub recorded");
                    ctx.finish_item(&id);
                    continue;
                }
                Err(err) => {
                    ctx.errors.record("fetch", err.kind());
                    if err.is_retryable() {
                        ctx.note_metadata_failure();
                    }
                    tracing::warn!(paper = %id, kind = err.kind(), "fetch failed; item dropped");
                    ctx.finish_item(&id);
                    continue;
                }
            }
        } else {
            // Offline mode: whatever the store already knows, else a stub.
            match ctx.writer.graph().get_paper(&id) {
                Ok(Some(paper)) => paper,
                _ => Paper::stub(id.clone()),
            }
        };

        // Expansion below the depth bound only; leaves need no edge list.
        let mut references = Vec::new();
        let mut citing = Vec::new();
        if ctx.config.use_metadata && depth < ctx.config.max_depth {
            references = fetch_link_pages(&ctx, &id, LinkDirection::References).await;
            let neighbor_ids: Vec<PaperId> =
                references.iter().map(|r| r.id.clone()).collect();
            let mut enqueued = ctx.frontier.enqueue_neighbors(depth, &neighbor_ids);

            if ctx.config.expand_citations {
                let incoming = fetch_link_pages(&ctx, &id, LinkDirection::Citations).await;
                let citing_ids: Vec<PaperId> = incoming.iter().map(|r| r.id.clone()).collect();
                enqueued += ctx.frontier.enqueue_neighbors(depth, &citing_ids);
                citing = citing_ids;
            }

            ctx.counters.add_discovered(enqueued as u64);
            if let Some(checkpointer) = &ctx.checkpointer {
                checkpointer.note_discovered(enqueued, &ctx);
            }
        }

        if ctx.should_stop() {
            return;
        }
        ctx.counters.inc_fetched();

        let item = FetchedPaper {
            paper,
            depth,
            references,
            citing,
        };
        if send_bounded(&qb_tx, item, &ctx.cancel).await.is_err() {
            return;
        }
    }
}

enum LinkDirection {
    References,
    Citations,
}

/// Paginate one link listing until the fan-out cap is covered or the
/// cursor runs out. Page errors are counted and truncate the listing.
async fn fetch_link_pages(
    ctx: &RunContext,
    id: &PaperId,
    direction: LinkDirection,
) -> Vec<CitationRef> {
    let mut collected = Vec::new();
    let mut cursor = None;
    loop {
        let page = match direction {
            LinkDirection::References => {
                ctx.metadata.get_references(id, cursor, &ctx.cancel).await
            }
            LinkDirection::Citations => {
                ctx.metadata.get_citations(id, cursor, &ctx.cancel).await
            }
        };
        match page {
            Ok(page) => {
                collected.extend(page.items);
                match page.next {
                    Some(next) if collected.len() < ctx.config.max_fanout_per_paper => {
                        cursor = Some(next);
                    }
                    _ => break,
                }
            }
            Err(ProviderError::Cancelled) => break,
            Err(err) => {
                ctx.errors.record("fetch", err.kind());
                if err.is_retryable() {
                    ctx.note_metadata_failure();
                }
                break;
            }
        }
    }
    collected
}

/// Stage C: run the analyzer, tolerating partial enrichments.
async fn analyze_worker(
    ctx: Arc<RunContext>,
    qb_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FetchedPaper>>>,
    qc_tx: mpsc::Sender<AnalyzedPaper>,
) {
    while let Some(item) = recv_bounded(&qb_rx, &ctx.cancel).await {
        let existing = ctx.writer.graph().get_paper(&item.paper.id).ok().flatten();
        let enrichment = match ctx
            .analyzer
            .enrich(item.paper, item.references, existing.as_ref(), &ctx.cancel)
            .await
        {
            Ok(enrichment) => enrichment,
            // Only cancellation aborts an enrichment.
            Err(_) => return,
        };

        let mut saw_transient = false;
        for failure in &enrichment.failures {
            ctx.errors.record("analyze", failure.kind);
            saw_transient |= failure.transient;
            tracing::debug!(
                paper = %enrichment.paper.id,
                step = failure.step.as_str(),
                kind = failure.kind,
                "enrichment sub-step failed"
            );
        }
        // Track analysis-provider health the same way fetch tracks the
        // metadata provider: a paper degraded by provider outages counts
        // against the window, any served call resets it.
        if saw_transient {
            ctx.note_analysis_failure();
        } else if enrichment.provider_calls > 0 {
            ctx.note_analysis_success();
        }
        ctx.counters.inc_analyzed();

        let item = AnalyzedPaper {
            enrichment,
            citing: item.citing,
        };
        if send_bounded(&qc_tx, item, &ctx.cancel).await.is_err() {
            return;
        }
    }
}

/// Stage D: persist the enrichment through the dual-store writer.
async fn persist_worker(
    ctx: Arc<RunContext>,
    qc_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AnalyzedPaper>>>,
) {
    while let Some(item) = recv_bounded(&qc_rx, &ctx.cancel).await {
        let enrichment = &item.enrichment;
        let id = enrichment.paper.id.clone();

        let mut ops = Vec::with_capacity(2 + enrichment.references.len());
        ops.push(WriteOp::Paper(enrichment.paper.clone()));
        for reference in &enrichment.references {
            ops.push(WriteOp::Citation {
                src: id.clone(),
                dst: reference.dst.clone(),
                attrs: reference.attrs.clone(),
            });
        }
        for citing in &item.citing {
            ops.push(WriteOp::Citation {
                src: citing.clone(),
                dst: id.clone(),
                attrs: Default::default(),
            });
        }
        if !enrichment.mentions.is_empty() {
            ops.push(WriteOp::ConceptMentions {
                paper: id.clone(),
                mentions: enrichment.mentions.clone(),
            });
        }

        match persist_with_busy_retry(&ctx, &ops).await {
            Ok(()) => {
                ctx.counters.inc_persisted();
            }
            Err(err) if err.is_fatal() => {
                ctx.declare_fatal(format!("unrecoverable store error: {}", err));
                ctx.finish_item(&id);
                return;
            }
            Err(err @ StoreError::Busy(_)) => {
                ctx.declare_fatal(format!("store unhealthy: {}", err));
                ctx.finish_item(&id);
                return;
            }
            Err(err) => {
                ctx.errors.record("persist", err.kind());
                tracing::warn!(paper = %id, error = %err, "persist failed; item dropped");
            }
        }
        ctx.finish_item(&id);
    }
}

/// Retry a busy store with short backoff before declaring it unhealthy.
async fn persist_with_busy_retry(ctx: &RunContext, ops: &[WriteOp]) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        match ctx.writer.batch(ops) {
            Ok(outcome) => {
                for deferred in outcome.deferred {
                    ctx.errors.record("persist", "embedding_deferred");
                    tracing::debug!(paper = %deferred, "embedding deferred to backfill");
                }
                return Ok(());
            }
            Err(StoreError::Busy(reason)) => {
                attempt += 1;
                if attempt >= STORE_BUSY_ATTEMPTS {
                    return Err(StoreError::Busy(reason));
                }
                ctx.errors.record("persist", "store_busy");
                tokio::time::sleep(Duration::from_millis(50u64 << attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}
