//! Join gate unblocking a downstream step once its inputs are closed.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::collection::CollectionStateHandle;
use crate::core::GateState;

/// A callback type for gate release notifications.
pub type GateCallback = Box<dyn Fn() + Send + Sync>;

/// A downstream synchronization point.
///
/// The gate moves from WAITING to RUNNABLE the first time every registered
/// dependency reports CLOSED, and never moves back. A gate with no
/// dependencies stays WAITING.
pub struct JoinGate {
    name: String,
    dependencies: RwLock<Vec<CollectionStateHandle>>,
    runnable: AtomicBool,
    callbacks: RwLock<Vec<GateCallback>>,
}

impl JoinGate {
    /// Creates a waiting gate.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: RwLock::new(Vec::new()),
            runnable: AtomicBool::new(false),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Adds dependencies. A handle for a collection already registered
    /// under the same name replaces the old one, so a restarted stage can
    /// re-register its outputs.
    pub fn register<I>(&self, dependencies: I)
    where
        I: IntoIterator<Item = CollectionStateHandle>,
    {
        let mut deps = self.dependencies.write();
        for handle in dependencies {
            match deps.iter_mut().find(|d| d.name() == handle.name()) {
                Some(existing) => *existing = handle,
                None => deps.push(handle),
            }
        }
    }

    /// Returns true once every dependency is closed.
    ///
    /// The first true observation flips the gate to RUNNABLE and invokes
    /// the release callbacks; later calls return true without re-checking.
    pub fn poll(&self) -> bool {
        if self.is_runnable() {
            return true;
        }

        let all_closed = {
            let deps = self.dependencies.read();
            !deps.is_empty() && deps.iter().all(CollectionStateHandle::is_closed)
        };
        if !all_closed {
            return false;
        }

        if self
            .runnable
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(gate = %self.name, "Join gate runnable");
            let callbacks = self.callbacks.read();
            for callback in callbacks.iter() {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!(gate = %self.name, "Gate callback panicked: {:?}", e);
                }
            }
        }
        true
    }

    /// Registers a callback invoked once when the gate becomes runnable.
    ///
    /// If already runnable, the callback is invoked immediately.
    pub fn on_runnable<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_runnable() {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback();
            })) {
                warn!(gate = %self.name, "Gate callback panicked: {:?}", e);
            }
        } else {
            self.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns the gate state without polling dependencies.
    #[must_use]
    pub fn state(&self) -> GateState {
        if self.is_runnable() {
            GateState::Runnable
        } else {
            GateState::Waiting
        }
    }

    /// Returns true if the gate was released.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }

    /// Returns the gate name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the names of the registered dependencies.
    #[must_use]
    pub fn dependency_names(&self) -> Vec<String> {
        self.dependencies
            .read()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }
}

impl std::fmt::Debug for JoinGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinGate")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("dependencies", &self.dependency_names())
            .finish()
    }
}
