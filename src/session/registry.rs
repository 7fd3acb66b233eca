use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::SyncError;
use crate::session::{AutoCommitScheduler, CollabManager};
use crate::storage::StorageClient;

/// Relayed wire payload tagged with the originating connection, so the
/// sender can skip its own frames.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub sender_id: String,
    pub payload: String,
}

/// One live session: replicated-document state, auto-commit handle, the
/// connected-client set and the relay channel.
pub struct SessionEntry {
    pub id: String,
    pub collab: Mutex<CollabManager>,
    pub autocommit: AutoCommitScheduler,
    /// connection id → user id
    pub clients: RwLock<HashMap<String, String>>,
    pub relay: broadcast::Sender<RelayFrame>,
    /// Whether the workspace was restored from a remote archive.
    pub restored: bool,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub grace_period: Duration,
    pub idle_cooldown: Duration,
    pub sweep_interval: Duration,
    pub autocommit_debounce: Duration,
}

impl From<&Config> for RegistrySettings {
    fn from(config: &Config) -> Self {
        Self {
            grace_period: config.grace_period(),
            idle_cooldown: config.idle_cooldown(),
            sweep_interval: config.sweep_interval(),
            autocommit_debounce: config.autocommit_debounce(),
        }
    }
}

/// The shared map of live sessions, with the two cooperating cleanup paths:
/// disconnect-triggered grace-period tasks and the periodic idle sweep.
///
/// Constructed once in `main` and handed to the connection handler and the
/// sweeper; deliberately not a module-level singleton.
pub struct SessionRegistry {
    storage: Arc<StorageClient>,
    settings: RegistrySettings,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    /// Per-id bootstrap gates: concurrent joins for a never-seen id
    /// converge on one constructed session.
    bootstrap_gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(storage: Arc<StorageClient>, settings: RegistrySettings) -> Self {
        Self {
            storage,
            settings,
            sessions: RwLock::new(HashMap::new()),
            bootstrap_gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn storage(&self) -> &Arc<StorageClient> {
        &self.storage
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Look up a session, materializing and registering it on first use.
    /// This is the single gate for "session already exists" checks.
    pub async fn get_or_bootstrap(&self, session_id: &str) -> Result<Arc<SessionEntry>, SyncError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(SyncError::Protocol("server is shutting down".to_string()));
        }
        if let Some(entry) = self.get(session_id).await {
            return Ok(entry);
        }

        let gate = {
            let mut gates = self.bootstrap_gates.lock().await;
            gates
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // A racing join may have finished the bootstrap while we waited.
        if let Some(entry) = self.get(session_id).await {
            return Ok(entry);
        }

        let restored = match self.storage.materialize(session_id).await {
            Ok(restored) => restored,
            Err(e) => {
                // Release the gate, or a down backend grows the map with
                // every distinct failing id.
                self.bootstrap_gates.lock().await.remove(session_id);
                return Err(e);
            }
        };

        let autocommit = AutoCommitScheduler::new(
            self.storage.workspace_dir(session_id),
            self.settings.autocommit_debounce,
        );
        autocommit.initialize().await;

        let (relay, _) = broadcast::channel(256);
        let entry = Arc::new(SessionEntry {
            id: session_id.to_string(),
            collab: Mutex::new(CollabManager::new(session_id, self.storage.clone())),
            autocommit,
            clients: RwLock::new(HashMap::new()),
            relay,
            restored,
        });
        self.sessions
            .write()
            .await
            .insert(session_id.to_string(), entry.clone());
        info!("Session {} registered (restored: {})", session_id, restored);

        self.bootstrap_gates.lock().await.remove(session_id);
        Ok(entry)
    }

    /// Delayed cleanup after the last client disconnects. The task re-checks
    /// emptiness when the grace period elapses, so a rejoin in the meantime
    /// voids it without explicit cancellation.
    pub fn schedule_cleanup(self: &Arc<Self>, session_id: String) {
        let registry = self.clone();
        let grace = self.settings.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(entry) = registry.get(&session_id).await else {
                return;
            };
            if !entry.clients.read().await.is_empty() {
                debug!(
                    "Grace period for session {} elapsed with clients present, keeping it",
                    session_id
                );
                return;
            }
            info!("Grace period elapsed for empty session {}", session_id);
            registry.cleanup(&session_id).await;
        });
    }

    /// Tear down one session unless a client slipped in. The emptiness
    /// check happens under the sessions write lock, after any wait for it:
    /// a join that raced the grace task and registered itself keeps the
    /// session alive. Taking the entry out of the map first makes a second
    /// invocation a guaranteed no-op.
    pub async fn cleanup(&self, session_id: &str) {
        let entry = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.remove(session_id) else {
                return;
            };
            if !entry.clients.read().await.is_empty() {
                debug!(
                    "Cleanup of session {} raced a rejoin, keeping it",
                    session_id
                );
                sessions.insert(session_id.to_string(), entry);
                return;
            }
            entry
        };
        self.teardown(&entry).await;
    }

    /// Dispose documents, cancel auto-commit, best-effort persist. The
    /// entry is already out of the registry map.
    async fn teardown(&self, entry: &SessionEntry) {
        entry.collab.lock().await.dispose();
        entry.autocommit.cleanup();
        if let Err(e) = self.storage.persist(&entry.id).await {
            // Accepted data-loss risk on a down backend; the session is
            // evicted regardless.
            error!("Failed to persist session {} during cleanup: {}", entry.id, e);
        }
        info!("Session {} evicted from registry", entry.id);
    }

    /// Periodic backstop against missed or lost grace-period tasks: evict
    /// every empty session whose activity is older than the cooldown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.settings.sweep_interval);
            loop {
                interval.tick().await;
                if registry.closed.load(Ordering::Relaxed) {
                    return;
                }
                let entries: Vec<Arc<SessionEntry>> =
                    registry.sessions.read().await.values().cloned().collect();
                for entry in entries {
                    if !entry.clients.read().await.is_empty() {
                        continue;
                    }
                    if entry
                        .collab
                        .lock()
                        .await
                        .is_active(registry.settings.idle_cooldown)
                    {
                        continue;
                    }
                    warn!("Sweeping idle session {}", entry.id);
                    registry.cleanup(&entry.id).await;
                }
            }
        })
    }

    /// Stop accepting new joins.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Shutdown path: tear down every registered session, clients or not.
    pub async fn drain(&self) {
        let entries: Vec<(String, Arc<SessionEntry>)> =
            self.sessions.write().await.drain().collect();
        info!("Draining {} session(s)", entries.len());
        for (_, entry) in entries {
            self.teardown(&entry).await;
        }
    }
}
