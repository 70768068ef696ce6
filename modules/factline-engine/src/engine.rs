//! The dispatch/apply engine.
//!
//! One engine instance drives the pipeline for a store pair: events are
//! pulled from the queue strictly in version order and fed through
//! preprocess → reduce → apply → derive, one at a time, never two in
//! flight. Callers waiting on a version are pure observers multiplexed
//! onto the single loop through the waiter table.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use factline_events::{ErrorMap, Event, EventQueue, ResultMap};
use serde_json::json;
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::db;
use crate::error::{EsdbError, Result};
use crate::metadata;
use crate::migrate::{self, Migration, MigrationContext};
use crate::traits::{Capabilities, EntityModel, Reduction};

/// Reserved for the engine's own version tracking.
const METADATA_NAME: &str = "metadata";

const NOTIFICATION_CAPACITY: usize = 256;

/// Store pair configuration.
#[derive(Debug, Clone, Default)]
pub struct EsdbOptions {
    /// Store file. `None` opens a single shared in-memory database.
    pub file: Option<PathBuf>,
    /// Queue file. Defaults to the store file; when the two resolve to the
    /// same file they share one live connection.
    pub queue_file: Option<PathBuf>,
    /// Cross-process poll interval for tail reads.
    pub poll_interval: Option<Duration>,
}

/// One entity registration: the model plus its pending migrations.
pub struct EntityDef {
    pub name: String,
    pub model: Arc<dyn EntityModel>,
    pub migrations: Vec<Arc<dyn Migration>>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>, model: Arc<dyn EntityModel>) -> Self {
        Self {
            name: name.into(),
            model,
            migrations: Vec::new(),
        }
    }

    pub fn with_migration(mut self, migration: Arc<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }
}

/// Observation emitted per handled event.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The event applied cleanly.
    Result,
    /// Some phase recorded a failure.
    Error,
    /// Emitted for every event regardless of outcome.
    Handled,
}

struct Entity {
    name: String,
    model: Arc<dyn EntityModel>,
    caps: Capabilities,
}

#[derive(Default)]
struct PollState {
    running: bool,
    min_version: i64,
    idle: bool,
    stop: bool,
    task: Option<JoinHandle<()>>,
}

enum Target {
    Version(i64),
    Idle,
}

struct Inner {
    rw: SqlitePool,
    ro: SqlitePool,
    queue: EventQueue,
    queue_shares_rw: bool,
    entities: Vec<Entity>,
    by_name: HashMap<String, usize>,
    waiters: Mutex<BTreeMap<i64, Vec<oneshot::Sender<Event>>>>,
    poll: Mutex<PollState>,
    notifications: broadcast::Sender<Notification>,
}

/// Event-sourcing database: ordered log in, serializable entity state out.
#[derive(Clone)]
pub struct Esdb {
    inner: Arc<Inner>,
}

impl Esdb {
    /// Open the store pair, set up tables, run pending migrations, and
    /// start catching up on unapplied events.
    pub async fn open(options: EsdbOptions, entities: Vec<EntityDef>) -> Result<Esdb> {
        let mut by_name = HashMap::new();
        for (i, def) in entities.iter().enumerate() {
            if def.name == METADATA_NAME {
                return Err(EsdbError::Setup(format!(
                    "{METADATA_NAME} is a reserved entity name"
                )));
            }
            if !def.model.capabilities().any() {
                return Err(EsdbError::Setup(format!(
                    "{}: at least one reducer, deriver or preprocessor required",
                    def.name
                )));
            }
            if by_name.insert(def.name.clone(), i).is_some() {
                return Err(EsdbError::Setup(format!(
                    "{}: entity registered twice",
                    def.name
                )));
            }
        }

        let (rw, queue_pool, queue_shares_rw) = match &options.file {
            None => {
                let pool = db::memory_pool().await?;
                match &options.queue_file {
                    None => (pool.clone(), pool, true),
                    Some(queue_file) => {
                        let queue_pool = db::writer_pool(queue_file).await?;
                        (pool, queue_pool, false)
                    }
                }
            }
            Some(file) => {
                let rw = db::writer_pool(file).await?;
                let (queue_pool, shares) = match &options.queue_file {
                    Some(queue_file) if !db::same_file(file, queue_file) => {
                        (db::writer_pool(queue_file).await?, false)
                    }
                    _ => (rw.clone(), true),
                };
                (rw, queue_pool, shares)
            }
        };

        let mut queue = EventQueue::new(queue_pool);
        if let Some(interval) = options.poll_interval {
            queue = queue.with_poll_interval(interval);
        }
        queue.setup().await?;
        metadata::setup(&rw).await?;
        migrate::setup(&rw).await?;

        {
            let mut conn = rw.acquire().await?;
            for def in &entities {
                def.model.setup(&mut conn).await?;
            }
        }

        // Migrations run before the loop services any event; they may
        // append follow-up events to the queue.
        for def in &entities {
            let ctx = MigrationContext {
                rw: &rw,
                queue: &queue,
                entity: &def.name,
                model: def.model.as_ref(),
            };
            migrate::run_pending(&ctx, &def.migrations).await?;
        }

        // The read-only side opens only after setup created the file.
        let ro = match &options.file {
            None => rw.clone(),
            Some(file) => db::reader_pool(file).await?,
        };

        let entities = entities
            .into_iter()
            .map(|def| Entity {
                caps: def.model.capabilities(),
                name: def.name,
                model: def.model,
            })
            .collect();

        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let esdb = Esdb {
            inner: Arc::new(Inner {
                rw,
                ro,
                queue,
                queue_shares_rw,
                entities,
                by_name,
                waiters: Mutex::new(BTreeMap::new()),
                poll: Mutex::new(PollState::default()),
                notifications,
            }),
        };
        // Catch up on anything already in the queue (ours or another
        // process's) and keep listening for version 1+.
        esdb.start_polling(Target::Version(1)).await;
        Ok(esdb)
    }

    /// Append an event and wait until that exact version is handled.
    ///
    /// Resolves with the finalized event, or fails with
    /// [`EsdbError::EventFailed`] carrying it when any phase errored.
    pub async fn dispatch(&self, event_type: &str, data: serde_json::Value) -> Result<Event> {
        self.dispatch_at(event_type, data, None).await
    }

    pub async fn dispatch_at(
        &self,
        event_type: &str,
        data: serde_json::Value,
        ts: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Event> {
        let event = self.inner.queue.add(event_type, data, ts).await?;
        self.handled_version(event.v).await
    }

    /// Wait until version `v` is handled; `Ok(None)` when `v` is 0
    /// (nothing to wait for).
    pub async fn wait_for_version(&self, v: i64) -> Result<Option<Event>> {
        if v <= 0 {
            return Ok(None);
        }
        self.handled_version(v).await.map(Some)
    }

    /// Wait until everything currently in the queue is handled.
    pub async fn wait_for_queue(&self) -> Result<Option<Event>> {
        let latest = self.inner.queue.latest_version().await?;
        self.wait_for_version(latest).await
    }

    /// The latest durably-applied version. Read fresh each call: another
    /// process may have advanced it.
    pub async fn current_version(&self) -> Result<i64> {
        Ok(metadata::get_version(&self.inner.ro).await?)
    }

    pub fn queue(&self) -> &EventQueue {
        &self.inner.queue
    }

    /// Per-event observations: `Result` or `Error`, then always `Handled`.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Read-only access to one entity's committed state.
    pub fn reader(&self, name: &str) -> Result<EntityReader> {
        let idx = self
            .inner
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| EsdbError::Setup(format!("{name}: unknown entity")))?;
        Ok(EntityReader {
            pool: self.inner.ro.clone(),
            model: self.inner.entities[idx].model.clone(),
        })
    }

    /// Keep polling for events written by other processes sharing the
    /// same storage, until [`stop_polling`](Self::stop_polling).
    pub async fn poll_forever(&self) {
        self.start_polling(Target::Idle).await;
    }

    /// Cooperative stop: the event currently in flight is finished, then
    /// the loop exits.
    ///
    /// Registered waiters stay pending: a later `wait_for_version` or
    /// `dispatch` restarts the loop and they resolve once their version
    /// applies. [`close`](Self::close) rejects them with
    /// [`EsdbError::Stopped`].
    pub async fn stop_polling(&self) {
        let task = {
            let mut poll = self.inner.poll.lock().await;
            poll.idle = false;
            poll.stop = poll.running;
            poll.task.take()
        };
        self.inner.queue.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Stop the loop and close every connection. Outstanding waiters are
    /// rejected with [`EsdbError::Stopped`].
    pub async fn close(&self) {
        self.stop_polling().await;
        self.inner.waiters.lock().await.clear();
        self.inner.queue.close().await;
        self.inner.rw.close().await;
        self.inner.ro.close().await;
    }

    async fn handled_version(&self, v: i64) -> Result<Event> {
        if v <= self.current_version().await? {
            let event = self
                .inner
                .queue
                .get(v)
                .await?
                .ok_or(EsdbError::MissingEvent(v))?;
            return finalize(event);
        }

        let rx = {
            let mut waiters = self.inner.waiters.lock().await;
            let (tx, rx) = oneshot::channel();
            waiters.entry(v).or_default().push(tx);
            rx
        };
        self.start_polling(Target::Version(v)).await;

        // The version may have been handled between the check and the
        // registration; sweep so the waiter cannot be stranded.
        let current = self.current_version().await?;
        if current >= v {
            self.inner.sweep_waiters(current, None).await;
        }

        match rx.await {
            Ok(event) => finalize(event),
            Err(_) => Err(EsdbError::Stopped),
        }
    }

    async fn start_polling(&self, target: Target) {
        let mut poll = self.inner.poll.lock().await;
        match target {
            Target::Version(v) => {
                if v > poll.min_version {
                    poll.min_version = v;
                }
            }
            Target::Idle => poll.idle = true,
        }
        if !poll.running {
            poll.running = true;
            poll.stop = false;
            poll.task = Some(tokio::spawn(run_loop(self.inner.clone())));
        }
    }
}

fn finalize(event: Event) -> Result<Event> {
    if event.is_err() {
        Err(EsdbError::EventFailed(Box::new(event)))
    } else {
        Ok(event)
    }
}

/// Applies events until the outstanding target is met and no idle
/// obligation remains. A storage fault while committing an outcome is
/// fatal: tracked version and logged outcome must never diverge, so the
/// only safe recovery is a restart and a log re-scan.
async fn run_loop(inner: Arc<Inner>) {
    loop {
        let last_v = match inner.poll_pass().await {
            Ok(v) => v,
            Err(err) => {
                error!(error = %err, "fatal: could not record event outcome");
                std::process::exit(100);
            }
        };

        let mut poll = inner.poll.lock().await;
        if poll.stop {
            poll.stop = false;
            poll.min_version = 0;
            poll.running = false;
            return;
        }
        if poll.min_version != 0 && last_v < poll.min_version {
            // Target raised while this pass was finishing.
            continue;
        }
        poll.min_version = 0;
        if poll.idle {
            continue;
        }
        poll.running = false;
        return;
    }
}

impl Inner {
    /// One polling pass. Returns the last version it applied.
    async fn poll_pass(&self) -> Result<i64> {
        let mut last_v = 0i64;
        loop {
            let (min, idle, stop) = {
                let poll = self.poll.lock().await;
                (poll.min_version, poll.idle, poll.stop)
            };
            if stop {
                return Ok(last_v);
            }
            if min != 0 && last_v >= min {
                return Ok(last_v);
            }

            let current = metadata::get_version(&self.rw).await?;
            let wait_if_empty = idle || min != 0;
            let Some(mut event) = self.queue.get_next(current, wait_if_empty).await? else {
                // Drained below the target, or the long-poll was cancelled.
                return Ok(last_v);
            };

            // A row can carry a stale outcome when an operator forces a
            // replay; the pipeline recomputes it.
            event.result = None;
            event.error = None;
            event.failed_result = None;

            let finalized = self.apply_pipeline(event).await?;
            last_v = finalized.v;
            self.settle(finalized).await;
        }
    }

    /// The per-event state machine. Runs on the single read-write
    /// connection; `Err` here is the fatal class.
    async fn apply_pipeline(&self, mut event: Event) -> Result<Event> {
        let mut conn = self.rw.acquire().await?;
        let mut errors: ErrorMap = BTreeMap::new();

        // Preprocess and reduce read before any write on this connection,
        // so every hook observes the committed pre-event snapshot.
        event = self.run_preprocessors(&mut conn, event, &mut errors).await;

        let mut result: ResultMap = BTreeMap::new();
        if errors.is_empty() {
            for entity in self.entities.iter().filter(|e| e.caps.reducer) {
                match entity.model.reduce(&mut conn, &event).await {
                    Ok(Reduction::NoChange) => {}
                    Ok(Reduction::Mutate(changes)) => {
                        result.insert(entity.name.clone(), changes);
                    }
                    Ok(Reduction::Fail(value)) => {
                        errors.insert(entity.name.clone(), value);
                    }
                    Err(err) => {
                        errors.insert(entity.name.clone(), json!({ "message": err.to_string() }));
                    }
                }
            }
            if !errors.is_empty() {
                // All-or-nothing across entities.
                result.clear();
            }
        }

        let current = metadata::get_version(&mut *conn).await?;
        let bump_version = event.v > current;
        if !bump_version {
            // Unreachable through the polling path; guards forced replays.
            result.clear();
            errors.insert(
                METADATA_NAME.to_string(),
                json!({
                    "message": format!(
                        "current version {current} is >= event version {}",
                        event.v
                    )
                }),
            );
        }

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        if errors.is_empty() && !result.is_empty() {
            sqlx::query("SAVEPOINT apply").execute(&mut *conn).await?;
            match self.apply_mutations(&mut conn, &result).await {
                Ok(()) => {
                    sqlx::query("RELEASE SAVEPOINT apply")
                        .execute(&mut *conn)
                        .await?;
                }
                Err(err) => {
                    warn!(v = event.v, error = %err, "apply failed; rolling back this event's mutations");
                    sqlx::query("ROLLBACK TO SAVEPOINT apply")
                        .execute(&mut *conn)
                        .await?;
                    errors.insert("_apply".to_string(), json!({ "message": err.to_string() }));
                    event.failed_result = Some(std::mem::take(&mut result));
                }
            }
        }

        // The event counts as handled even when a phase failed: the
        // version bump and the outcome rewrite share this commit unit.
        if bump_version {
            metadata::set_version(&mut conn, event.v).await?;
        }
        event.result = if errors.is_empty() && !result.is_empty() {
            Some(result)
        } else {
            None
        };
        event.error = if errors.is_empty() {
            None
        } else {
            Some(errors)
        };
        self.persist_outcome(&mut conn, &event).await?;

        if event.error.is_none() && self.entities.iter().any(|e| e.caps.deriver) {
            sqlx::query("SAVEPOINT derive").execute(&mut *conn).await?;
            let applied = event.result.clone().unwrap_or_default();
            match self.run_derivers(&mut conn, &event, &applied).await {
                Ok(()) => {
                    sqlx::query("RELEASE SAVEPOINT derive")
                        .execute(&mut *conn)
                        .await?;
                }
                Err((name, err)) => {
                    warn!(v = event.v, entity = %name, error = %err, "derive failed; rolling back derived state");
                    sqlx::query("ROLLBACK TO SAVEPOINT derive")
                        .execute(&mut *conn)
                        .await?;
                    event.failed_result = event.result.take();
                    let mut derive_error = BTreeMap::new();
                    derive_error.insert(
                        "_derive".to_string(),
                        json!({ "message": format!("{name}: {err}") }),
                    );
                    event.error = Some(derive_error);
                    self.persist_outcome(&mut conn, &event).await?;
                }
            }
        }

        sqlx::query("COMMIT").execute(&mut *conn).await?;
        debug!(v = event.v, ok = event.error.is_none(), "event handled");
        Ok(event)
    }

    /// Run the preprocessor chain; the first failure aborts it.
    async fn run_preprocessors(
        &self,
        conn: &mut SqliteConnection,
        mut event: Event,
        errors: &mut ErrorMap,
    ) -> Event {
        for entity in self.entities.iter().filter(|e| e.caps.preprocessor) {
            match entity.model.preprocess(conn, &event).await {
                Ok(None) => {}
                Ok(Some(replacement)) => {
                    if replacement.v != event.v {
                        errors.insert(
                            "_preprocess".to_string(),
                            json!({
                                "message": format!(
                                    "{}: preprocessor must retain event version",
                                    entity.name
                                )
                            }),
                        );
                        return event;
                    }
                    if replacement.event_type.is_empty() {
                        errors.insert(
                            "_preprocess".to_string(),
                            json!({
                                "message": format!(
                                    "{}: preprocessor must return event type",
                                    entity.name
                                )
                            }),
                        );
                        return event;
                    }
                    event = replacement;
                }
                Err(err) => {
                    errors.insert(entity.name.clone(), json!({ "message": err.to_string() }));
                    return event;
                }
            }
        }
        event
    }

    async fn apply_mutations(
        &self,
        conn: &mut SqliteConnection,
        result: &ResultMap,
    ) -> anyhow::Result<()> {
        for (name, changes) in result {
            let idx = self
                .by_name
                .get(name)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("{name}: unknown entity in result"))?;
            self.entities[idx].model.apply_changes(conn, changes).await?;
        }
        Ok(())
    }

    async fn run_derivers(
        &self,
        conn: &mut SqliteConnection,
        event: &Event,
        applied: &ResultMap,
    ) -> std::result::Result<(), (String, anyhow::Error)> {
        for entity in self.entities.iter().filter(|e| e.caps.deriver) {
            entity
                .model
                .derive(conn, event, applied)
                .await
                .map_err(|err| (entity.name.clone(), err))?;
        }
        Ok(())
    }

    async fn persist_outcome(&self, conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        if self.queue_shares_rw {
            // Shares the apply transaction's connection: the outcome
            // rewrite joins the same commit unit.
            self.queue.set_on(conn, event).await?;
        } else {
            self.queue.set(event).await?;
        }
        Ok(())
    }

    /// Resolve/reject waiters and broadcast observations for one handled
    /// event. Never fails: a waiter that cannot be resolved is logged and
    /// dropped, which rejects its caller with `Stopped`.
    async fn settle(&self, event: Event) {
        self.sweep_waiters(event.v, Some(&event)).await;

        let kind = if event.is_err() {
            NotificationKind::Error
        } else {
            NotificationKind::Result
        };
        let _ = self.notifications.send(Notification {
            kind,
            event: event.clone(),
        });
        let _ = self.notifications.send(Notification {
            kind: NotificationKind::Handled,
            event,
        });
    }

    /// Resolve every waiter whose version is now at or below the
    /// high-water mark, even under bursts. `direct` short-circuits the
    /// queue lookup for the event just handled.
    async fn sweep_waiters(&self, upto: i64, direct: Option<&Event>) {
        let due = {
            let mut waiters = self.waiters.lock().await;
            let rest = waiters.split_off(&(upto + 1));
            std::mem::replace(&mut *waiters, rest)
        };

        for (v, senders) in due {
            let resolved = match direct {
                Some(event) if event.v == v => Some(event.clone()),
                _ => match self.queue.get(v).await {
                    Ok(found) => found,
                    Err(err) => {
                        warn!(v, error = %err, "could not look up event for waiter");
                        None
                    }
                },
            };
            match resolved {
                Some(event) => {
                    for tx in senders {
                        let _ = tx.send(event.clone());
                    }
                }
                None => warn!(v, "no stored event for awaited version; dropping waiters"),
            }
        }
    }
}

/// Committed-state read access for one entity, on the read-only
/// connection. Never observes a half-applied event.
pub struct EntityReader {
    pool: SqlitePool,
    model: Arc<dyn EntityModel>,
}

impl EntityReader {
    pub async fn get(&self, id: &serde_json::Value) -> Result<Option<serde_json::Value>> {
        let mut conn = self.pool.acquire().await?;
        Ok(self.model.get(&mut conn, id).await?)
    }

    pub async fn exists(&self, id: &serde_json::Value) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(self.model.exists(&mut conn, id).await?)
    }
}
