//! The transaction coordinator: a FIFO serializer binding in-memory core
//! work to durable appends and post-commit effect fan-out.
//!
//! The coordinator runs on a dedicated thread that exclusively owns the
//! [`Core`] and the [`LogWriter`]. It receives jobs from an `mpsc`
//! channel and processes them strictly in submission order; each job's
//! critical section runs to completion before the next starts, which is
//! what makes the core's counters safe to read without further locking.
//!
//! Public API: [`Handle`] (cloneable async handle) and
//! [`Coordinator::start`] (factory that spawns the worker thread).

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::Core;
use crate::effect::EffectHandler;
use crate::error::{CoreError, SubmitError};
use crate::event::{Command, Event, EventDraft};
use crate::lss::LogWriter;

/// Type-erased critical section run by the worker against the core.
type CriticalSection =
    Box<dyn FnOnce(&mut Core) -> Result<Box<dyn Any + Send>, CoreError> + Send>;

/// Result of a committed job before the caller recovers its value type.
struct RawCommit {
    events: Vec<Event>,
    value: Box<dyn Any + Send>,
}

/// Messages sent from [`Handle`]s to the worker loop.
enum Job {
    /// Run a critical section, append its events, reply with the commit.
    Work {
        work: CriticalSection,
        reply: oneshot::Sender<Result<RawCommit, SubmitError>>,
    },
    /// Gracefully stop the worker after draining prior jobs.
    Shutdown,
}

/// The events and return value of one committed transaction.
///
/// `events` is the whole durable transaction, machine follow-ups
/// included; `value` is whatever the critical section returned.
#[derive(Debug)]
pub struct Commit<T> {
    /// All events appended by this transaction, in emission order.
    pub events: Vec<Event>,
    /// The critical section's return value.
    pub value: T,
}

/// Cloneable async handle to a running coordinator.
#[derive(Clone)]
pub struct Handle {
    jobs: mpsc::Sender<Job>,
    fatal: watch::Receiver<bool>,
}

impl Handle {
    /// Queue a critical section and wait for its commit.
    ///
    /// The section may call `produce`/`consume`/`query` on the core and
    /// return an arbitrary value. Jobs run strictly in FIFO order, one at
    /// a time.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Rejected`] -- the section failed; the transaction
    ///   was rolled back and the coordinator continues with the next job.
    /// - [`SubmitError::Fatal`] -- the durable append failed; the
    ///   coordinator has stopped.
    /// - [`SubmitError::Stopped`] -- the coordinator is no longer running.
    pub async fn submit<T, F>(&self, section: F) -> Result<Commit<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Core) -> Result<T, CoreError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let work: CriticalSection =
            Box::new(move |core| section(core).map(|v| Box::new(v) as Box<dyn Any + Send>));
        self.jobs
            .send(Job::Work { work, reply: tx })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        let raw = rx.await.map_err(|_| SubmitError::Stopped)??;
        let value = *raw
            .value
            .downcast::<T>()
            .expect("critical section reply must carry the submitted type");
        Ok(Commit {
            events: raw.events,
            value,
        })
    }

    /// Interpret one command in its own transaction.
    ///
    /// The commit's `value` holds the events produced directly by the
    /// command; `events` holds the whole durable transaction.
    ///
    /// # Errors
    ///
    /// See [`submit`](Handle::submit).
    pub async fn execute(&self, command: Command) -> Result<Commit<Vec<EventDraft>>, SubmitError> {
        self.submit(move |core| core.produce(&command)).await
    }

    /// Record one externally-sourced fact in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`submit`](Handle::submit).
    pub async fn ingest(&self, event: EventDraft) -> Result<Commit<()>, SubmitError> {
        self.submit(move |core| core.consume(event)).await
    }

    /// Path-walk the view-state tree inside the serialization token.
    ///
    /// # Errors
    ///
    /// See [`submit`](Handle::submit); the query itself cannot fail, so
    /// only coordinator-level errors occur.
    pub async fn query(&self, path: Vec<String>) -> Result<Option<Value>, SubmitError> {
        let commit = self.submit(move |core| Ok(core.query(&path))).await?;
        Ok(commit.value)
    }

    /// Ask the worker to stop once all previously queued jobs are done.
    pub async fn shutdown(&self) {
        let _ = self.jobs.send(Job::Shutdown).await;
    }

    /// A watch that flips to `true` when a fatal storage failure has
    /// stopped the coordinator. The process should exit non-zero and
    /// recover from the log on restart.
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal.clone()
    }

    /// Whether a fatal storage failure has stopped the coordinator.
    pub fn is_fatal(&self) -> bool {
        *self.fatal.borrow()
    }
}

/// Factory for the coordinator worker thread.
pub struct Coordinator;

impl Coordinator {
    /// Spawn the worker thread that owns `core` and `writer`.
    ///
    /// Registered effect handlers are spawned onto the current tokio
    /// runtime after each commit, so `start` must be called from within a
    /// runtime.
    pub fn start(
        core: Core,
        writer: Box<dyn LogWriter>,
        effects: Vec<Arc<dyn EffectHandler>>,
    ) -> Handle {
        let (job_tx, job_rx) = mpsc::channel::<Job>(64);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let runtime = tokio::runtime::Handle::current();
        let handle = Handle {
            jobs: job_tx,
            fatal: fatal_rx,
        };

        let effect_handle = handle.clone();
        std::thread::spawn(move || {
            run_worker(core, writer, effects, job_rx, fatal_tx, runtime, effect_handle);
        });

        handle
    }
}

/// The coordinator loop.
///
/// Runs on a dedicated thread; a minimal current-thread runtime drives
/// the channel receive so the loop stays self-contained regardless of
/// the parent runtime's flavor.
fn run_worker(
    mut core: Core,
    mut writer: Box<dyn LogWriter>,
    effects: Vec<Arc<dyn EffectHandler>>,
    mut jobs: mpsc::Receiver<Job>,
    fatal: watch::Sender<bool>,
    runtime: tokio::runtime::Handle,
    handle: Handle,
) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to create coordinator receive runtime");

    while let Some(job) = rt.block_on(jobs.recv()) {
        let (work, reply) = match job {
            Job::Work { work, reply } => (work, reply),
            Job::Shutdown => break,
        };

        let _span = tracing::debug_span!("transaction").entered();

        // 1. Run the critical section synchronously.
        let value = match work(&mut core) {
            Ok(value) => value,
            Err(e) => {
                // 2. Local failure: roll back, notify, continue.
                core.rollback();
                tracing::warn!(error = %e, "critical section failed, transaction rolled back");
                let _ = reply.send(Err(SubmitError::Rejected(e)));
                continue;
            }
        };

        // 3. Take the transaction buffer.
        let drafts = core.commit();

        // 4./5. Durably append unless the transaction is empty.
        let events = if drafts.is_empty() {
            Vec::new()
        } else {
            match writer.physical_append(drafts) {
                Ok(events) => events,
                Err(e) => {
                    // Durability of in-memory state can no longer be
                    // reconciled with the log; stop accepting work.
                    tracing::error!(error = %e, "durable append failed, coordinator stopping");
                    let _ = reply.send(Err(SubmitError::Fatal(e)));
                    let _ = fatal.send(true);
                    return;
                }
            }
        };

        // 6. Notify the caller.
        let _ = reply.send(Ok(RawCommit {
            events: events.clone(),
            value,
        }));

        // 7. Fan out to post-commit effects. Callbacks run outside the
        // serialization token and re-enter through their own handle, so
        // they never block the next job.
        for effect in &effects {
            let effect = Arc::clone(effect);
            let engine = handle.clone();
            let events = events.clone();
            runtime.spawn(async move {
                if let Err(e) = effect.on_commit(&events, &engine).await {
                    tracing::warn!(error = %e, "post-commit effect failed");
                }
            });
        }
    }
    tracing::info!("coordinator stopped");
}
