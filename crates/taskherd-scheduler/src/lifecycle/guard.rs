//! Reference-counted signal cleanup.
//!
//! Several [`TaskManager`](crate::manager::TaskManager) instances may live in
//! one process. The signal listener is installed when the first instance
//! registers and torn down when the last one leaves; in between, a Ctrl+C or
//! SIGTERM runs every live instance's hook once.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identifies one registration with a [`LifecycleGuard`].
pub type InstanceId = u64;

/// Cleanup run when the process receives a termination signal.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    async fn on_process_exit(&self);
}

struct Registration {
    hook: Weak<dyn ShutdownHook>,
    exit_on_signal: bool,
}

#[derive(Default)]
struct GuardState {
    next_id: InstanceId,
    registrations: HashMap<InstanceId, Registration>,
    installed: bool,
    listener: Option<JoinHandle<()>>,
}

/// Shared, reference-counted owner of the process signal listener.
pub struct LifecycleGuard {
    state: Arc<Mutex<GuardState>>,
    listen_for_signals: bool,
}

static GLOBAL_GUARD: LazyLock<Arc<LifecycleGuard>> =
    LazyLock::new(|| Arc::new(LifecycleGuard::new()));

impl LifecycleGuard {
    /// A guard that installs OS signal listeners.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::default())),
            listen_for_signals: true,
        }
    }

    /// A guard that only counts registrations and never touches OS signals.
    /// Hooks can still be run through [`run_hooks`](Self::run_hooks).
    pub fn detached() -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::default())),
            listen_for_signals: false,
        }
    }

    /// The process-wide guard.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_GUARD)
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        lock_state(&self.state)
    }

    /// Register an instance. Installs the listener on the 0 -> 1 transition.
    ///
    /// Returns the registration id and the resulting reference count.
    pub fn acquire(
        &self,
        hook: Weak<dyn ShutdownHook>,
        exit_on_signal: bool,
    ) -> (InstanceId, usize) {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.registrations.insert(
            id,
            Registration {
                hook,
                exit_on_signal,
            },
        );
        let count = state.registrations.len();

        if count == 1 && !state.installed {
            state.installed = true;
            if self.listen_for_signals {
                state.listener = self.spawn_listener();
            }
            info!("Process cleanup handlers installed");
        }
        debug!(instance = id, count, "Lifecycle guard acquired");
        (id, count)
    }

    /// Drop a registration. Removes the listener on the 1 -> 0 transition.
    ///
    /// Unknown ids leave the count unchanged. Returns the remaining count.
    pub fn release(&self, id: InstanceId) -> usize {
        let mut state = self.lock();
        if state.registrations.remove(&id).is_none() {
            return state.registrations.len();
        }
        let count = state.registrations.len();
        if count == 0 && state.installed {
            state.installed = false;
            if let Some(listener) = state.listener.take() {
                listener.abort();
            }
            info!("Process cleanup handlers removed");
        }
        debug!(instance = id, count, "Lifecycle guard released");
        count
    }

    /// Number of live registrations.
    pub fn count(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Whether cleanup handlers are currently installed.
    pub fn is_installed(&self) -> bool {
        self.lock().installed
    }

    /// Run every live hook once. Returns how many ran.
    pub async fn run_hooks(&self) -> usize {
        run_registered_hooks(&self.state).await.0
    }

    fn spawn_listener(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; signal cleanup will not run automatically");
            return None;
        };
        let state = Arc::clone(&self.state);
        Some(runtime.spawn(async move {
            let Some(signo) = wait_for_signal().await else {
                return;
            };
            info!(signal = signo, "Received termination signal, cleaning up background tasks");
            let (ran, exit) = run_registered_hooks(&state).await;
            debug!(hooks = ran, "Signal cleanup finished");
            if exit {
                std::process::exit(128 + signo);
            }
        }))
    }
}

impl Default for LifecycleGuard {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns (hooks run, whether any live registration asked to exit).
async fn run_registered_hooks(state: &Mutex<GuardState>) -> (usize, bool) {
    let (hooks, exit): (Vec<Arc<dyn ShutdownHook>>, bool) = {
        let state = lock_state(state);
        let live: Vec<_> = state
            .registrations
            .values()
            .filter_map(|r| r.hook.upgrade().map(|h| (h, r.exit_on_signal)))
            .collect();
        let exit = live.iter().any(|(_, exit)| *exit);
        (live.into_iter().map(|(h, _)| h).collect(), exit)
    };
    for hook in &hooks {
        hook.on_process_exit().await;
    }
    (hooks.len(), exit)
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<i32> {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                r = tokio::signal::ctrl_c() => r.ok().map(|()| 2),
                _ = sigterm.recv() => Some(15),
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok().map(|()| 2)
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<i32> {
    tokio::signal::ctrl_c().await.ok().map(|()| 2)
}
