//! Async hosting for fusion sessions.
//!
//! Each [`FusionSession`] runs on its own tokio task behind a bounded
//! input queue. Cancellation is honored only at cycle boundaries: a
//! shutdown request never interrupts a cycle in flight. Under overload
//! the submit path sheds low-confidence observations that are not
//! attached to any confirmed track, and nothing else.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::session::{CycleOutput, DigestEntry, FusionSession, ObservationBatch, SessionStats};
use crate::{FusionError, Result};

/// Spawns sessions onto the runtime.
#[derive(Debug, Default)]
pub struct SessionRunner;

impl SessionRunner {
    /// Move a session onto its own task.
    ///
    /// Returns the control handle and the receiver of per-cycle outputs.
    /// The task stops when the handle requests shutdown, the input queue
    /// closes, or the output receiver is dropped.
    pub fn spawn(session: FusionSession) -> (SessionHandle, mpsc::Receiver<CycleOutput>) {
        let capacity = session.config().queue_capacity;
        let overload_min_confidence = session.config().overload_min_confidence;
        let (batch_tx, batch_rx) = mpsc::channel::<ObservationBatch>(capacity);
        let (output_tx, output_rx) = mpsc::channel::<CycleOutput>(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = session.stats();
        let digest = session.digest();
        let join = tokio::spawn(run_loop(session, batch_rx, output_tx, shutdown_rx));

        let handle = SessionHandle {
            batch_tx,
            shutdown_tx,
            stats,
            digest,
            overload_min_confidence,
            join: Mutex::new(Some(join)),
        };
        (handle, output_rx)
    }
}

async fn run_loop(
    mut session: FusionSession,
    mut batch_rx: mpsc::Receiver<ObservationBatch>,
    output_tx: mpsc::Sender<CycleOutput>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                tracing::info!("session shutdown requested; stopping at cycle boundary");
                break;
            }
            maybe_batch = batch_rx.recv() => {
                let Some(batch) = maybe_batch else {
                    tracing::debug!("session input queue closed");
                    break;
                };
                match session.run_cycle(batch) {
                    Ok(output) => {
                        if output_tx.send(output).await.is_err() {
                            tracing::debug!("session output receiver dropped");
                            break;
                        }
                    }
                    Err(err) => {
                        // Malformed input never reaches here; anything
                        // else is a session-fatal condition.
                        tracing::error!(error = %err, "session cycle failed; stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Control handle for a spawned session.
#[derive(Debug)]
pub struct SessionHandle {
    batch_tx: mpsc::Sender<ObservationBatch>,
    shutdown_tx: watch::Sender<bool>,
    stats: Arc<SessionStats>,
    digest: Arc<RwLock<Vec<DigestEntry>>>,
    overload_min_confidence: f64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Submit a batch for processing.
    ///
    /// When the bounded queue is full the batch is first thinned by the
    /// overload policy (drop observations that are both below the
    /// overload confidence floor and unattached to any confirmed track);
    /// whatever survives is then delivered, waiting for queue space if
    /// necessary.
    pub async fn submit(&self, batch: ObservationBatch) -> Result<()> {
        match self.batch_tx.try_send(batch) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(FusionError::ChannelClosed),
            Err(mpsc::error::TrySendError::Full(batch)) => {
                let thinned = self.shed_load(batch);
                self.batch_tx
                    .send(thinned)
                    .await
                    .map_err(|_| FusionError::ChannelClosed)
            }
        }
    }

    /// Shared statistics of the hosted session.
    pub fn stats(&self) -> Arc<SessionStats> {
        Arc::clone(&self.stats)
    }

    /// Request shutdown; the session finishes its current cycle first.
    pub fn request_shutdown(&self) {
        // An Err means the task already exited, which is fine.
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the session task to stop. Idempotent.
    pub async fn join(&self) {
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "session task panicked");
            }
        }
    }

    /// Request shutdown and wait for it.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        self.join().await;
    }

    /// Overload drop policy: keep an observation when it is attached to a
    /// confirmed track or its confidence clears the floor.
    fn shed_load(&self, mut batch: ObservationBatch) -> ObservationBatch {
        let digest = self.digest.read();
        let before = batch.observations.len();
        batch.observations.retain(|obs| {
            if obs.confidence >= self.overload_min_confidence {
                return true;
            }
            digest.iter().any(|entry| {
                entry.position.surface_distance_m(&obs.position) <= entry.radius_m
            })
        });
        let dropped = (before - batch.observations.len()) as u64;
        if dropped > 0 {
            self.stats
                .overload_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(dropped, "overload: shed low-confidence unattached observations");
        }
        batch
    }
}

/// Named registry of running sessions, one per region.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under a region name, replacing any previous
    /// entry. The replaced handle (if any) is returned so the caller can
    /// shut it down.
    pub fn register(
        &self,
        name: impl Into<String>,
        handle: SessionHandle,
    ) -> Option<Arc<SessionHandle>> {
        self.sessions.write().insert(name.into(), Arc::new(handle))
    }

    /// Look up a session by region name.
    pub fn get(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(name).cloned()
    }

    /// Remove a session, returning its handle for shutdown.
    pub fn remove(&self, name: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().remove(name)
    }

    /// Names of all registered sessions.
    pub fn names(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}
