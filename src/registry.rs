//! Owns every session by id and mediates start / stop / status calls.
//!
//! All mutations of the id -> session map go through one write lock, so
//! concurrent starts and stops on the same id are serialized. Process events
//! (diagnostics, exits) are delivered over channels and applied under the
//! same lock, tagged with the session epoch so that a process from an earlier
//! attempt can never touch a newer session that reuses its id.
//!
//! Status events are published before the sessions lock is released, so every
//! observer sees the transitions of one id in the order they happened.
//!
//! Terminal sessions (`Stopped`, `Failed`) stay queryable until
//! [`Registry::clear`] removes them or a new start replaces them.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::engine::{self, Engine};
use crate::error::SessionError;
use crate::profile;
use crate::session::{
    ConnectionStatus, DiagnosticsOutcome, Session, SessionDescriptor, StatusSnapshot,
};
use crate::supervisor::{self, ProcessEvent};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ingest_base: String,
    pub confirm_timeout: Duration,
    pub kill_grace: Duration,
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        RegistryConfig {
            ingest_base: config.ingest_base.clone(),
            confirm_timeout: config.confirm_timeout,
            kill_grace: config.kill_grace,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub id: String,
    pub snapshot: StatusSnapshot,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

struct Inner {
    config: RegistryConfig,
    engine: Arc<dyn Engine>,
    sessions: RwLock<HashMap<String, Session>>,
    subscribers: Mutex<Slab<mpsc::Sender<StatusEvent>>>,
    next_epoch: AtomicU64,
    exited: Notify,
}

impl Registry {
    /// Must be called from within a tokio runtime; starts the duration clock.
    pub fn new(config: RegistryConfig, engine: Arc<dyn Engine>) -> Self {
        let inner = Arc::new(Inner {
            config,
            engine,
            sessions: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Slab::new()),
            next_epoch: AtomicU64::new(1),
            exited: Notify::new(),
        });
        tokio::spawn(run_clock(Arc::downgrade(&inner)));
        Registry { inner }
    }

    /// Resolves once the confirmation window has elapsed with the live
    /// snapshot. A start that does not go live resolves with `StartFailed`
    /// only after its engine has exited.
    pub async fn start(
        &self,
        descriptor: SessionDescriptor,
    ) -> Result<StatusSnapshot, SessionError> {
        descriptor.validate().await?;
        let descriptor = Arc::new(descriptor);
        let id = descriptor.id.clone();
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);

        let events = {
            let mut sessions = self.inner.sessions.write().await;
            if sessions
                .get(&id)
                .map_or(false, |session| session.status().is_active())
            {
                return Err(SessionError::AlreadyRunning(id));
            }

            let profile = profile::resolve(descriptor.quality, descriptor.orientation);
            let args = engine::build_args(&descriptor, &profile, &self.inner.config.ingest_base);
            info!(
                "starting session {} -> {} ({}x{}, {}k)",
                id,
                engine::redacted_url(&self.inner.config.ingest_base),
                profile.width,
                profile.height,
                profile.max_bitrate_kbps
            );
            let (process, events) = supervisor::spawn(
                self.inner.engine.as_ref(),
                &args,
                self.inner.config.kill_grace,
            )
            .map_err(|e| {
                error!("failed to launch engine for session {}: {}", id, e);
                SessionError::Spawn(e)
            })?;

            let session = Session::connecting(descriptor.clone(), epoch, process);
            self.inner.publish(&id, session.snapshot()).await;
            sessions.insert(id.clone(), session);
            events
        };
        tokio::spawn(monitor(Arc::downgrade(&self.inner), id.clone(), epoch, events));

        tokio::time::sleep(self.inner.config.confirm_timeout).await;

        {
            let mut sessions = self.inner.sessions.write().await;
            let Some(session) = sessions
                .get_mut(&id)
                .filter(|session| session.epoch() == epoch)
            else {
                return Err(SessionError::StartFailed {
                    id,
                    reason: "session was cleared before it went live".into(),
                });
            };
            let was_connecting = session.status() == ConnectionStatus::Connecting;
            let live = session.confirm(Instant::now());
            if was_connecting {
                self.inner.publish(&id, session.snapshot()).await;
            }
            if live {
                return Ok(session.snapshot());
            }
        }

        let reason = match self.inner.settled(&id, epoch).await {
            Some(snapshot) => snapshot
                .last_error
                .unwrap_or_else(|| format!("session ended {:?}", snapshot.status)),
            None => "session was cleared before it went live".into(),
        };
        Err(SessionError::StartFailed { id, reason })
    }

    /// Signals the engine and returns; the exit completes the stop.
    pub async fn stop(&self, id: &str) -> Result<(), SessionError> {
        let mut sessions = self.inner.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotRunning(id.to_owned()))?;
        session.begin_stop()?;
        self.inner.publish(id, session.snapshot()).await;
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Option<StatusSnapshot> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(Session::snapshot)
    }

    pub async fn status_or_idle(&self, id: &str) -> StatusSnapshot {
        self.status(id).await.unwrap_or_else(StatusSnapshot::idle)
    }

    pub async fn list_active(&self) -> BTreeSet<String> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.status().is_active())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Forgets a terminal session. Returns whether anything was removed.
    pub async fn clear(&self, id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get(id) {
            None => Ok(false),
            Some(session) if session.status().is_active() => {
                Err(SessionError::AlreadyRunning(id.to_owned()))
            }
            Some(_) => {
                sessions.remove(id);
                debug!("cleared session {}", id);
                Ok(true)
            }
        }
    }

    /// Registers an observer for `(id, snapshot)` updates. Observers that
    /// fall behind lose events rather than stall the registry.
    pub async fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let key = self.inner.subscribers.lock().await.insert(tx);
        debug!("status subscriber {} registered", key);
        rx
    }

    /// Stops every running session. Returns how many were signalled.
    pub async fn shutdown(&self) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let stopped: Vec<StatusEvent> = sessions
            .iter_mut()
            .filter_map(|(id, session)| {
                session.begin_stop().ok()?;
                Some(StatusEvent {
                    id: id.clone(),
                    snapshot: session.snapshot(),
                })
            })
            .collect();
        let count = stopped.len();
        self.inner.publish_all(stopped).await;
        info!("signalled {} session(s) to stop", count);
        count
    }
}

impl Inner {
    async fn publish(&self, id: &str, snapshot: StatusSnapshot) {
        self.publish_all(vec![StatusEvent {
            id: id.to_owned(),
            snapshot,
        }])
        .await;
    }

    async fn publish_all(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().await;
        let mut closed = Vec::new();
        for (key, tx) in subscribers.iter() {
            for event in &events {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "status subscriber {} is lagging, dropped update for {}",
                            key, event.id
                        );
                    }
                    Err(TrySendError::Closed(_)) => {
                        closed.push(key);
                        break;
                    }
                }
            }
        }
        for key in closed {
            subscribers.remove(key);
            debug!("status subscriber {} went away", key);
        }
    }

    /// Waits until the session of this epoch no longer owns a process.
    /// Returns its final snapshot, or `None` if it was replaced or cleared.
    async fn settled(&self, id: &str, epoch: u64) -> Option<StatusSnapshot> {
        loop {
            let exited = self.exited.notified();
            tokio::pin!(exited);
            exited.as_mut().enable();
            {
                let sessions = self.sessions.read().await;
                match sessions.get(id).filter(|session| session.epoch() == epoch) {
                    Some(session) if session.status().is_active() => {}
                    session => return session.map(Session::snapshot),
                }
            }
            exited.await;
        }
    }

    async fn handle_process_event(&self, id: &str, epoch: u64, event: ProcessEvent) {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get_mut(id)
            .filter(|session| session.epoch() == epoch)
        else {
            debug!("ignoring engine event from a previous run of {}", id);
            return;
        };

        match event {
            ProcessEvent::Diagnostics(chunk) => {
                debug!("[{}] {}", id, session.redact(chunk.trim_end()));
                match catch_unwind(AssertUnwindSafe(|| session.on_diagnostics(&chunk))) {
                    Ok(DiagnosticsOutcome::Quiet) => return,
                    Ok(DiagnosticsOutcome::FatalStop) => {}
                    Err(_) => {
                        error!("diagnostics parser panicked for session {}", id);
                        session.fail("diagnostics parser panicked".into());
                    }
                }
                self.publish(id, session.snapshot()).await;
            }
            ProcessEvent::Exited(code) => {
                if session.process_exited(code) {
                    self.publish(id, session.snapshot()).await;
                }
                drop(sessions);
                self.exited.notify_waiters();
            }
        }
    }

    async fn tick(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let events: Vec<StatusEvent> = sessions
            .iter_mut()
            .filter(|(_, session)| session.status() == ConnectionStatus::Live)
            .map(|(id, session)| {
                if catch_unwind(AssertUnwindSafe(|| session.tick(now))).is_err() {
                    error!("duration clock panicked for session {}", id);
                    session.fail("duration clock panicked".into());
                }
                StatusEvent {
                    id: id.clone(),
                    snapshot: session.snapshot(),
                }
            })
            .collect();
        self.publish_all(events).await;
    }
}

async fn monitor(
    inner: Weak<Inner>,
    id: String,
    epoch: u64,
    mut events: mpsc::Receiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_process_event(&id, epoch, event).await;
    }
}

async fn run_clock(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            debug!("registry dropped, duration clock exiting");
            break;
        };
        inner.tick().await;
    }
}
