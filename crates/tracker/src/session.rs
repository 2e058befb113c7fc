//! The single-threaded session loop.
//!
//! One task owns all mutable state. Feed inputs, scheduler ticks, timers and
//! network completions are multiplexed with `tokio::select!`, so series
//! mutations never interleave. Connectivity changes arrive on the input queue
//! so they stay ordered with the polls around them. Network calls run in
//! spawned tasks and report back tagged with `(identity, generation, call)`;
//! completions for a replaced context or a superseded call are dropped.

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use common::config::Config;
use common::pointstore::{PointStore, PointStoreError, RemoteSeries};
use common::series::{Series, SeriesSet};
use common::store::{KvStore, StoreError};
use common::types::{
    now_ms, AccountSnapshot, ClassifiedEvent, Identity, Metric, PriceTick, SyncMeta, TimePoint,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::{DelayQueue, Expired, Key};
use tracing::{debug, error, info, warn};

use crate::dashboard::{oldest_point, Dashboard, DashboardSource};
use crate::detector::ChangeDetector;
use crate::journal::{EventJournal, JournalUpdate};
use crate::scheduler::{self, JobSpec, Tick};
use crate::sync::SyncEngine;
use crate::window::{self, Timeframe};

/// Messages accepted by the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Identity(String),
    /// Connectivity change, ordered with the polls around it.
    Online(bool),
    Price(PriceTick),
    Account(AccountSnapshot),
    Timeframe(Timeframe),
    ClearEvents,
    Shutdown,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Pulled(Result<Option<RemoteSeries>, PointStoreError>),
    Pushed {
        revision: u64,
        points: usize,
        result: Result<(), PointStoreError>,
    },
}

/// A finished network call, tagged with the context and call that started it.
#[derive(Debug)]
pub struct SyncResponse {
    pub identity: Identity,
    pub generation: u64,
    pub call: u64,
    pub outcome: SyncOutcome,
}

/// Cancellation handles of the calls currently on the wire.
#[derive(Debug, Default)]
struct InFlightCalls {
    pull: Option<CancellationToken>,
    push: Option<CancellationToken>,
}

impl InFlightCalls {
    /// Cancel whatever occupies `slot` and hand out a fresh token for the next call.
    fn replace(slot: &mut Option<CancellationToken>, parent: &CancellationToken) -> CancellationToken {
        if let Some(previous) = slot.take() {
            previous.cancel();
        }
        let token = parent.child_token();
        *slot = Some(token.clone());
        token
    }

    fn cancel_all(&mut self) {
        for token in [self.pull.take(), self.push.take()].into_iter().flatten() {
            token.cancel();
        }
    }
}

/// State owned by one identity. Replaced wholesale on every identity switch.
pub struct SessionContext {
    pub identity: Identity,
    pub generation: u64,
    pub series: SeriesSet,
    pub detector: ChangeDetector,
    pub journal: EventJournal,
    pub sync: SyncEngine,
    pub cancel: CancellationToken,
    calls: InFlightCalls,
}

impl SessionContext {
    pub async fn load(
        identity: Identity,
        generation: u64,
        config: &Config,
        store: &KvStore,
        updates: broadcast::Sender<JournalUpdate>,
        parent: &CancellationToken,
    ) -> Result<Self, StoreError> {
        let capacity = config.series.capacity;
        let mut loaded = Vec::with_capacity(Metric::ALL.len());
        for metric in Metric::ALL {
            loaded.push(store.load_series(&identity, metric, capacity).await?);
        }
        let series = SeriesSet::from_series(&identity, capacity, loaded);
        let journal = EventJournal::load(
            identity.clone(),
            config.journal.capacity,
            store.clone(),
            updates,
        )
        .await?;
        Ok(Self::assemble(
            identity, generation, config, store, series, journal, parent,
        ))
    }

    pub fn empty(
        identity: Identity,
        generation: u64,
        config: &Config,
        store: &KvStore,
        updates: broadcast::Sender<JournalUpdate>,
        parent: &CancellationToken,
    ) -> Self {
        let series = SeriesSet::empty(&identity, config.series.capacity);
        let journal = EventJournal::empty(
            identity.clone(),
            config.journal.capacity,
            store.clone(),
            updates,
        );
        Self::assemble(
            identity, generation, config, store, series, journal, parent,
        )
    }

    fn assemble(
        identity: Identity,
        generation: u64,
        config: &Config,
        store: &KvStore,
        series: SeriesSet,
        journal: EventJournal,
        parent: &CancellationToken,
    ) -> Self {
        // Stake detection continues from the last recorded value.
        let last_stake = series.get(Metric::Stake).latest().map(|p| p.v);
        let push_stall_ms =
            i64::try_from(config.sync.pull_interval_secs.saturating_mul(1_000)).unwrap_or(i64::MAX);
        Self {
            detector: ChangeDetector::resume(&config.detector, last_stake),
            sync: SyncEngine::new(identity.clone(), store.schema_version(), push_stall_ms),
            cancel: parent.child_token(),
            calls: InFlightCalls::default(),
            identity,
            generation,
            series,
            journal,
        }
    }

    /// Write every series and the journal in one transaction.
    pub async fn persist(&self, store: &KvStore, now_ms: i64) -> Result<(), StoreError> {
        store
            .persist_snapshot(
                &self.identity,
                self.series.iter(),
                self.journal.events(),
                now_ms,
            )
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Timer {
    Push,
    Resolve(String),
}

struct SessionTimers {
    queue: DelayQueue<Timer>,
    push_key: Option<Key>,
    debounce: Duration,
    resolve_delay: Duration,
}

impl SessionTimers {
    fn new(debounce: Duration, resolve_delay: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            push_key: None,
            debounce,
            resolve_delay,
        }
    }

    /// Start the push debounce, or restart it if it is already running.
    fn arm_push(&mut self) {
        match &self.push_key {
            Some(key) => self.queue.reset(key, self.debounce),
            None => self.push_key = Some(self.queue.insert(Timer::Push, self.debounce)),
        }
    }

    fn cancel_push(&mut self) {
        if let Some(key) = self.push_key.take() {
            self.queue.remove(&key);
        }
    }

    fn schedule_resolve(&mut self, id: String) {
        self.queue.insert(Timer::Resolve(id), self.resolve_delay);
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.push_key = None;
    }

    fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<Timer>> {
        let timer = ready!(self.queue.poll_expired(cx)).map(Expired::into_inner);
        if timer == Some(Timer::Push) {
            self.push_key = None;
        }
        Poll::Ready(timer)
    }
}

/// Spawns point-store calls for the current context.
struct Network<P> {
    client: Option<Arc<P>>,
    tx: mpsc::UnboundedSender<SyncResponse>,
}

impl<P: PointStore> Network<P> {
    fn enabled(&self) -> bool {
        self.client.is_some()
    }

    fn pull(&self, ctx: &mut SessionContext, online: bool, now_ms: i64) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let Some(call) = ctx.sync.begin_pull(online, now_ms) else {
            return;
        };
        let identity = ctx.identity.clone();
        let generation = ctx.generation;
        let cancel = InFlightCalls::replace(&mut ctx.calls.pull, &ctx.cancel);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = client.fetch(&identity) => result,
            };
            let _ = tx.send(SyncResponse {
                identity,
                generation,
                call,
                outcome: SyncOutcome::Pulled(result),
            });
        });
    }

    fn push(&self, ctx: &mut SessionContext, online: bool, now_ms: i64) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let Some(request) = ctx.sync.begin_push(&ctx.series, online, now_ms) else {
            return;
        };
        let call = request.call;
        debug!(
            identity = %ctx.identity.short(),
            points = request.points,
            "pushing series"
        );
        let identity = ctx.identity.clone();
        let generation = ctx.generation;
        let cancel = InFlightCalls::replace(&mut ctx.calls.push, &ctx.cancel);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = client.push(&identity, &request.body) => result,
            };
            let _ = tx.send(SyncResponse {
                identity,
                generation,
                call,
                outcome: SyncOutcome::Pushed {
                    revision: request.revision,
                    points: request.points,
                    result,
                },
            });
        });
    }
}

pub struct Session<P> {
    config: Config,
    store: KvStore,
    network: Network<P>,
    responses: mpsc::UnboundedReceiver<SyncResponse>,
    ctx: Option<SessionContext>,
    generation: u64,
    meta: SyncMeta,
    online: bool,
    timeframe: Timeframe,
    last_price: Option<f64>,
    timers: SessionTimers,
    journal_updates: broadcast::Sender<JournalUpdate>,
    dashboard: watch::Sender<Dashboard>,
    cancel: CancellationToken,
}

impl<P: PointStore> Session<P> {
    /// `remote` is `None` when syncing is disabled; the session then runs
    /// purely local.
    pub fn new(config: Config, store: KvStore, remote: Option<P>) -> Self {
        let (tx, responses) = mpsc::unbounded_channel();
        let (journal_updates, _) = broadcast::channel(256);
        let (dashboard, _) = watch::channel(Dashboard::default());
        let timers = SessionTimers::new(
            Duration::from_millis(config.sync.debounce_ms),
            Duration::from_millis(config.journal.resolve_delay_ms),
        );
        Self {
            config,
            store,
            network: Network {
                client: remote.map(Arc::new),
                tx,
            },
            responses,
            ctx: None,
            generation: 0,
            meta: SyncMeta::default(),
            online: false,
            timeframe: Timeframe::Live,
            last_price: None,
            timers,
            journal_updates,
            dashboard,
            cancel: CancellationToken::new(),
        }
    }

    pub fn dashboard(&self) -> watch::Receiver<Dashboard> {
        self.dashboard.subscribe()
    }

    /// Journal changes for whichever identity is current. Survives identity switches.
    pub fn journal_updates(&self) -> broadcast::Receiver<JournalUpdate> {
        self.journal_updates.subscribe()
    }

    /// Cancelling this token stops the scheduler and every in-flight call.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the session until `Input::Shutdown` or the input channel closes.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<Input>, online: bool) {
        self.meta = match self.store.load_sync_meta().await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(error = %e, "failed to load sync meta, starting from zero");
                SyncMeta::default()
            }
        };
        self.online = online;

        let (tick_tx, mut ticks) = mpsc::channel(8);
        let _jobs = scheduler::start(
            vec![
                JobSpec {
                    name: "pull",
                    interval: Duration::from_secs(self.config.sync.pull_interval_secs),
                    tick: Tick::Pull,
                    tx: tick_tx.clone(),
                },
                JobSpec {
                    name: "render",
                    interval: Duration::from_millis(self.config.render.tick_ms),
                    tick: Tick::Render,
                    tx: tick_tx,
                },
            ],
            &self.cancel,
        );

        info!(
            online = self.online,
            remote = self.network.enabled(),
            points_synced = self.meta.points_synced,
            "session started"
        );
        self.publish();

        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(Input::Shutdown) | None => break,
                    Some(input) => self.handle_input(input).await,
                },
                Some(tick) = ticks.recv() => self.handle_tick(tick),
                Some(timer) = poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    self.handle_timer(timer).await;
                }
                Some(response) = self.responses.recv() => self.handle_response(response).await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Identity(raw) => self.select_identity(&raw).await,
            Input::Online(online) => self.set_online(online).await,
            Input::Price(tick) => {
                self.on_price(tick).await;
                self.publish();
            }
            Input::Account(snapshot) => {
                self.on_account(snapshot).await;
                self.publish();
            }
            Input::Timeframe(timeframe) => self.set_timeframe(timeframe),
            Input::ClearEvents => self.clear_events().await,
            Input::Shutdown => {}
        }
    }

    /// Switch to `raw`. The outgoing context is persisted and cancelled before
    /// the incoming one is loaded.
    async fn select_identity(&mut self, raw: &str) {
        let identity = match Identity::parse(raw) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "ignoring identity change");
                return;
            }
        };
        if self.ctx.as_ref().is_some_and(|c| c.identity == identity) {
            debug!(identity = %identity.short(), "identity unchanged");
            return;
        }

        let now = now_ms();
        if let Some(outgoing) = self.ctx.take() {
            if let Err(e) = outgoing.persist(&self.store, now).await {
                error!(
                    identity = %outgoing.identity.short(),
                    error = %e,
                    "failed to persist outgoing identity"
                );
            }
            outgoing.cancel.cancel();
        }
        self.timers.clear();
        self.generation += 1;

        let mut ctx = match SessionContext::load(
            identity.clone(),
            self.generation,
            &self.config,
            &self.store,
            self.journal_updates.clone(),
            &self.cancel,
        )
        .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(identity = %identity.short(), error = %e, "failed to load identity, starting empty");
                SessionContext::empty(
                    identity.clone(),
                    self.generation,
                    &self.config,
                    &self.store,
                    self.journal_updates.clone(),
                    &self.cancel,
                )
            }
        };

        // Events left pending by an earlier session still get settled.
        for event in ctx.journal.events().iter().filter(|e| e.is_pending()) {
            self.timers.schedule_resolve(event.id.clone());
        }

        let points: usize = ctx.series.iter().map(Series::len).sum();
        info!(
            identity = %identity.short(),
            generation = self.generation,
            points,
            events = ctx.journal.len(),
            "identity selected"
        );
        record_event(
            &mut ctx,
            &mut self.timers,
            ClassifiedEvent::info("Session ready", identity.short(), now),
        )
        .await;
        self.network.pull(&mut ctx, self.online, now);

        let oldest = oldest_point(&ctx.series);
        if !window::is_available(self.timeframe, oldest.as_ref(), now) {
            self.timeframe = Timeframe::Live;
        }
        self.ctx = Some(ctx);
        self.publish();
    }

    async fn on_price(&mut self, tick: PriceTick) {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            metrics::counter!("tracker_points_rejected_total", "metric" => Metric::Price.as_str())
                .increment(1);
            debug!(price = tick.price, "dropping malformed price tick");
            return;
        }
        self.last_price = Some(tick.price);
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };

        let now = tick.at.unwrap_or_else(now_ms);
        if !ctx
            .series
            .get_mut(Metric::Price)
            .append(TimePoint::new(now, tick.price))
        {
            debug!(at = now, "price tick at a taken or invalid timestamp, ignoring");
            return;
        }
        metrics::counter!("tracker_points_recorded_total", "metric" => Metric::Price.as_str())
            .increment(1);
        persist_series(&self.store, &ctx.series, &[Metric::Price], now).await;
        if let Some(event) = ctx.detector.observe_price(tick.price, now) {
            record_event(ctx, &mut self.timers, event).await;
        }
    }

    async fn on_account(&mut self, snapshot: AccountSnapshot) {
        if !snapshot.is_well_formed() {
            metrics::counter!("tracker_points_rejected_total", "metric" => "account").increment(1);
            debug!(?snapshot, "dropping malformed account snapshot");
            return;
        }
        let Some(ctx) = self.ctx.as_mut() else {
            debug!("account snapshot before any identity, ignoring");
            return;
        };

        let now = snapshot.at.unwrap_or_else(now_ms);
        let observation = ctx
            .detector
            .observe_account(&snapshot, self.last_price, &ctx.series, now);

        let mut changed = Vec::new();
        let mut events = Vec::new();
        let detections = [
            (Metric::Stake, observation.stake),
            (Metric::Withdrawal, observation.withdrawal),
        ];
        for (metric, detection) in detections {
            let Some(detection) = detection else { continue };
            if ctx.series.get_mut(metric).append(detection.point) {
                changed.push(metric);
                events.extend(detection.event);
            }
        }
        if let Some(point) = observation.net_worth {
            if ctx.series.get_mut(Metric::NetWorth).append(point) {
                changed.push(Metric::NetWorth);
            }
        }
        for metric in &changed {
            metrics::counter!("tracker_points_recorded_total", "metric" => metric.as_str())
                .increment(1);
        }

        for event in events {
            record_event(ctx, &mut self.timers, event).await;
        }

        if !changed.is_empty() {
            persist_series(&self.store, &ctx.series, &changed, now).await;
            if ctx.sync.mark_dirty(self.online) {
                self.timers.arm_push();
            }
        }
    }

    fn set_timeframe(&mut self, timeframe: Timeframe) {
        let oldest = self.ctx.as_ref().and_then(|c| oldest_point(&c.series));
        if !window::is_available(timeframe, oldest.as_ref(), now_ms()) {
            warn!(%timeframe, "timeframe not available for the retained history");
            return;
        }
        self.timeframe = timeframe;
        self.publish();
    }

    async fn clear_events(&mut self) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        if let Err(e) = ctx.journal.clear().await {
            warn!(identity = %ctx.identity.short(), error = %e, "failed to persist cleared journal");
        }
        self.publish();
    }

    async fn set_online(&mut self, online: bool) {
        if online == self.online {
            return;
        }
        self.online = online;
        info!(online, "connectivity changed");
        if !online {
            self.timers.cancel_push();
        }

        if let Some(ctx) = self.ctx.as_mut() {
            ctx.sync.set_online(online);
            if !online {
                ctx.calls.cancel_all();
            }
            let now = now_ms();
            let event = if online {
                ClassifiedEvent::info("Back online", "Sync resumed", now)
            } else {
                ClassifiedEvent::info("Offline", "Changes are kept locally", now)
            };
            record_event(ctx, &mut self.timers, event).await;
            if online {
                self.network.pull(ctx, true, now);
                if ctx.sync.is_dirty() {
                    self.timers.arm_push();
                }
            }
        }
        self.publish();
    }

    fn handle_tick(&mut self, tick: Tick) {
        match tick {
            Tick::Pull => {
                if let Some(ctx) = self.ctx.as_mut() {
                    self.network.pull(ctx, self.online, now_ms());
                    // Also the retry path for a failed or stalled push.
                    if self.online && ctx.sync.is_dirty() {
                        self.timers.arm_push();
                    }
                }
            }
            Tick::Render => self.publish(),
        }
    }

    async fn handle_timer(&mut self, timer: Timer) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        match timer {
            Timer::Push => self.network.push(ctx, self.online, now_ms()),
            Timer::Resolve(id) => match ctx.journal.resolve(&id, self.online).await {
                Ok(Some(status)) => debug!(id = %id, %status, "event resolved"),
                Ok(None) => {}
                Err(e) => warn!(id = %id, error = %e, "failed to persist resolved event"),
            },
        }
        self.publish();
    }

    async fn handle_response(&mut self, response: SyncResponse) {
        let SyncResponse {
            identity,
            generation,
            call,
            outcome,
        } = response;
        let Some(ctx) = self
            .ctx
            .as_mut()
            .filter(|c| c.generation == generation && c.identity == identity)
        else {
            metrics::counter!("tracker_stale_responses_total").increment(1);
            debug!(identity = %identity.short(), generation, "discarding stale sync response");
            return;
        };

        let owned = match &outcome {
            SyncOutcome::Pulled(_) => ctx.sync.owns_pull(call),
            SyncOutcome::Pushed { .. } => ctx.sync.owns_push(call),
        };
        if !owned {
            metrics::counter!("tracker_stale_responses_total").increment(1);
            debug!(identity = %identity.short(), call, "discarding superseded sync response");
            return;
        }

        let now = now_ms();
        match outcome {
            SyncOutcome::Pulled(result) => {
                ctx.calls.pull = None;
                let status = if result.is_ok() { "ok" } else { "error" };
                metrics::counter!("tracker_sync_pull_total", "status" => status).increment(1);

                let pulled = ctx.sync.finish_pull(&mut ctx.series, result, true);
                if !pulled.merged.is_empty() {
                    let added: usize = pulled.merged.iter().map(|(_, n)| n).sum();
                    info!(identity = %identity.short(), added, "merged remote points");
                    let touched: Vec<Metric> = pulled.merged.iter().map(|(m, _)| *m).collect();
                    persist_series(&self.store, &ctx.series, &touched, now).await;
                    ctx.detector
                        .seed_stake(ctx.series.get(Metric::Stake).latest().map(|p| p.v));
                }
                if pulled.schedule_push {
                    self.timers.arm_push();
                }
            }
            SyncOutcome::Pushed {
                revision,
                points,
                result,
            } => {
                ctx.calls.push = None;
                let ok = result.is_ok();
                metrics::counter!(
                    "tracker_sync_push_total",
                    "status" => if ok { "ok" } else { "error" }
                )
                .increment(1);
                let again = ctx
                    .sync
                    .finish_push(revision, points, result, &mut self.meta, now);
                if ok {
                    metrics::gauge!("tracker_points_synced").set(self.meta.points_synced as f64);
                    if let Err(e) = self.store.persist_sync_meta(&self.meta, now).await {
                        warn!(error = %e, "failed to persist sync meta");
                    }
                }
                if again {
                    self.timers.arm_push();
                }
            }
        }
        self.publish();
    }

    async fn shutdown(&mut self) {
        let now = now_ms();
        if let Some(ctx) = self.ctx.take() {
            if let Err(e) = ctx.persist(&self.store, now).await {
                error!(identity = %ctx.identity.short(), error = %e, "final persist failed");
            }
            ctx.cancel.cancel();
        }
        if let Err(e) = self.store.persist_sync_meta(&self.meta, now).await {
            warn!(error = %e, "failed to persist sync meta");
        }
        self.timers.clear();
        self.cancel.cancel();
        info!("session stopped");
    }

    fn publish(&self) {
        let source = self.ctx.as_ref().map(|ctx| DashboardSource {
            identity: &ctx.identity,
            series: &ctx.series,
            status: ctx.sync.status(),
            events: ctx.journal.events(),
        });
        let dashboard = Dashboard::build(source, self.timeframe, self.online, self.meta, now_ms());
        self.dashboard.send_replace(dashboard);
    }
}

async fn record_event(ctx: &mut SessionContext, timers: &mut SessionTimers, event: ClassifiedEvent) {
    if event.is_pending() {
        timers.schedule_resolve(event.id.clone());
    }
    if let Err(e) = ctx.journal.push(event).await {
        warn!(identity = %ctx.identity.short(), error = %e, "failed to persist journal");
    }
}

async fn persist_series(store: &KvStore, series: &SeriesSet, metrics: &[Metric], now_ms: i64) {
    for metric in metrics {
        if let Err(e) = store.persist_series(series.get(*metric), now_ms).await {
            error!(%metric, error = %e, "failed to persist series");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::pointstore::{PushBody, RemoteSeriesBody};
    use common::types::{EventKind, SCHEMA_VERSION};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Point store that never answers on its own; tests feed completions by hand.
    #[derive(Default)]
    struct SilentStore {
        fetches: AtomicUsize,
        pushes: Mutex<Vec<PushBody>>,
    }

    impl PointStore for SilentStore {
        async fn fetch(&self, _identity: &Identity) -> Result<Option<RemoteSeries>, PointStoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn push(&self, _identity: &Identity, body: &PushBody) -> Result<(), PointStoreError> {
            self.pushes.lock().unwrap().push(body.clone());
            std::future::pending().await
        }
    }

    async fn session() -> Session<SilentStore> {
        let store = KvStore::open_memory(SCHEMA_VERSION).await.unwrap();
        let mut s = Session::new(Config::default(), store, Some(SilentStore::default()));
        s.online = true;
        s
    }

    fn remote_stake(points: &[(i64, f64)]) -> RemoteSeries {
        RemoteSeries {
            stake: RemoteSeriesBody {
                points: points.iter().map(|(t, v)| TimePoint::new(*t, *v)).collect(),
            },
            ..Default::default()
        }
    }

    fn current_pull(s: &Session<SilentStore>) -> u64 {
        s.ctx.as_ref().unwrap().sync.pull_call().unwrap()
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn fetches(s: &Session<SilentStore>) -> usize {
        s.network
            .client
            .as_ref()
            .unwrap()
            .fetches
            .load(Ordering::SeqCst)
    }

    fn account(staked: f64, rewards: f64, at: i64) -> AccountSnapshot {
        AccountSnapshot {
            available: 1.0,
            staked,
            rewards,
            apr: 0.0,
            at: Some(at),
        }
    }

    #[tokio::test]
    async fn test_pull_for_previous_identity_is_discarded() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.select_identity("inj1bbb").await;
        assert_eq!(s.generation, 2);

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: 1,
            call: 1,
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(10, 5.0)])))),
        })
        .await;

        let ctx = s.ctx.as_ref().unwrap();
        assert_eq!(ctx.identity.as_str(), "inj1bbb");
        assert!(ctx.series.get(Metric::Stake).is_empty());
    }

    #[tokio::test]
    async fn test_generation_mismatch_is_discarded_for_same_identity() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.select_identity("inj1bbb").await;
        s.select_identity("inj1aaa").await;

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: 1,
            call: 1,
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(10, 5.0)])))),
        })
        .await;
        assert!(s.ctx.as_ref().unwrap().series.get(Metric::Stake).is_empty());
    }

    #[tokio::test]
    async fn test_current_pull_is_merged_and_persisted() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: s.generation,
            call: current_pull(&s),
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(10, 5.0), (20, 6.0)])))),
        })
        .await;

        assert_eq!(s.ctx.as_ref().unwrap().series.get(Metric::Stake).len(), 2);
        let stored = s
            .store
            .load_series(&Identity::parse("inj1aaa").unwrap(), Metric::Stake, 100)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(s.dashboard.borrow().stake.values.len(), 0, "live window excludes t=10");
    }

    #[tokio::test]
    async fn test_pull_completed_while_offline_is_discarded() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        let call = current_pull(&s);
        s.set_online(false).await;

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: s.generation,
            call,
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(10, 5.0)])))),
        })
        .await;
        assert!(s.ctx.as_ref().unwrap().series.get(Metric::Stake).is_empty());
    }

    #[tokio::test]
    async fn test_hung_pull_does_not_block_later_pulls() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        settle().await;
        assert_eq!(fetches(&s), 1);

        s.handle_tick(Tick::Pull);
        settle().await;
        s.handle_tick(Tick::Pull);
        settle().await;
        s.set_online(false).await;
        s.set_online(true).await;
        settle().await;

        assert_eq!(fetches(&s), 4);
        assert!(s.ctx.as_ref().unwrap().calls.pull.is_some());
    }

    #[tokio::test]
    async fn test_superseded_pull_answer_is_ignored() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        let first = current_pull(&s);
        s.handle_tick(Tick::Pull);
        let second = current_pull(&s);
        assert_ne!(first, second);

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: s.generation,
            call: first,
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(10, 5.0)])))),
        })
        .await;
        assert!(s.ctx.as_ref().unwrap().series.get(Metric::Stake).is_empty());

        s.handle_response(SyncResponse {
            identity: Identity::parse("inj1aaa").unwrap(),
            generation: s.generation,
            call: second,
            outcome: SyncOutcome::Pulled(Ok(Some(remote_stake(&[(20, 6.0)])))),
        })
        .await;
        let ctx = s.ctx.as_ref().unwrap();
        assert_eq!(ctx.series.get(Metric::Stake).points(), &[TimePoint::new(20, 6.0)]);
        assert!(ctx.calls.pull.is_none());
    }

    #[tokio::test]
    async fn test_pull_tick_rearms_push_for_dirty_data() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.on_account(account(5.0, 0.01, 1_000)).await;
        s.timers.clear();
        assert!(s.timers.push_key.is_none());

        s.handle_tick(Tick::Pull);
        assert!(s.timers.push_key.is_some());
    }

    #[tokio::test]
    async fn test_swap_persists_outgoing_identity() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.on_account(account(5.0, 0.01, 1_000)).await;
        s.on_account(account(6.25, 0.01, 2_000)).await;
        s.select_identity("inj1bbb").await;

        let aaa = Identity::parse("inj1aaa").unwrap();
        let stake = s.store.load_series(&aaa, Metric::Stake, 100).await.unwrap();
        assert_eq!(
            stake.points(),
            &[TimePoint::new(1_000, 5.0), TimePoint::new(2_000, 6.25)]
        );
        let events = s.store.load_events(&aaa).await.unwrap();
        assert!(events.iter().any(|e| e.title == "Stake increased"));

        // Switching back resumes stake detection from 6.25.
        s.select_identity("inj1aaa").await;
        s.on_account(account(6.25, 0.01, 3_000)).await;
        assert_eq!(s.ctx.as_ref().unwrap().series.get(Metric::Stake).len(), 2);
    }

    #[tokio::test]
    async fn test_poll_at_taken_timestamp_is_dropped_whole() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.on_account(account(5.0, 0.01, 1_000)).await;
        s.on_account(account(6.25, 0.01, 1_000)).await;
        s.on_account(account(6.25, 0.01, 2_000)).await;
        s.on_account(account(7.0, 0.01, 0)).await;

        let ctx = s.ctx.as_ref().unwrap();
        assert_eq!(
            ctx.series.get(Metric::Stake).points(),
            &[TimePoint::new(1_000, 5.0), TimePoint::new(2_000, 6.25)]
        );
        let increases: Vec<&str> = ctx
            .journal
            .events()
            .iter()
            .filter(|e| e.title == "Stake increased")
            .map(|e| e.detail.as_str())
            .collect();
        assert_eq!(increases, vec!["+1.250000 INJ"]);
    }

    #[tokio::test]
    async fn test_blank_identity_is_rejected() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.select_identity("   ").await;
        assert_eq!(s.ctx.as_ref().unwrap().identity.as_str(), "inj1aaa");
        assert_eq!(s.generation, 1);
    }

    #[tokio::test]
    async fn test_offline_writes_stay_dirty_without_push_timer() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.set_online(false).await;
        s.on_account(account(5.0, 0.01, 1_000)).await;

        let ctx = s.ctx.as_ref().unwrap();
        assert!(ctx.sync.is_dirty());
        assert!(s.timers.push_key.is_none());
        let titles: Vec<&str> = ctx.journal.events().iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["Offline", "Session ready"]);
    }

    #[tokio::test]
    async fn test_unavailable_timeframe_is_rejected() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.set_timeframe(Timeframe::Year);
        assert_eq!(s.timeframe, Timeframe::Live);
        s.set_timeframe(Timeframe::Day);
        assert_eq!(s.timeframe, Timeframe::Day);
    }

    #[tokio::test]
    async fn test_price_ticks_feed_series_and_events() {
        let mut s = session().await;
        s.select_identity("inj1aaa").await;
        s.on_price(PriceTick { price: 25.0, at: Some(1_000) }).await;
        s.on_price(PriceTick { price: f64::NAN, at: Some(1_500) }).await;
        s.on_price(PriceTick { price: 26.0, at: Some(2_000) }).await;

        let ctx = s.ctx.as_ref().unwrap();
        assert_eq!(ctx.series.get(Metric::Price).len(), 2);
        assert_eq!(ctx.journal.events()[0].kind, EventKind::Price);
        assert_eq!(s.last_price, Some(26.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_debounce_restarts_on_each_write() {
        let mut timers = SessionTimers::new(Duration::from_millis(1_200), Duration::from_millis(2_500));
        timers.arm_push();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        timers.arm_push();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let pending = poll_fn(|cx| Poll::Ready(timers.poll_expired(cx))).await;
        assert!(pending.is_pending());

        tokio::time::advance(Duration::from_millis(300)).await;
        let fired = poll_fn(|cx| timers.poll_expired(cx)).await;
        assert_eq!(fired, Some(Timer::Push));
        assert!(timers.push_key.is_none());
    }
}
