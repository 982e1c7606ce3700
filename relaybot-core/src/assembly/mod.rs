//! # Message Assembly
//!
//! Coalesces rapidly typed, multi-part user messages into one logical request.
//!
//! Each user with an in-flight burst owns one [`Assembler`] in the
//! [`AssemblyRegistry`]. Every fragment re-arms a completion check on the timer
//! runtime; when the check decides the burst is done, the assembler closes
//! itself and sends a [`CompletedBurst`] to the dispatch loop, which evicts it
//! from the registry and hands the text to the [`CompletionDispatcher`].
//! A [`JanitorTask`] retires bursts whose checks never fired.

pub mod assembler;
pub mod janitor;
pub mod policy;
pub mod registry;

pub use assembler::{Assembler, AssemblerState, CompletedBurst};
pub use janitor::JanitorTask;
pub use policy::CompletionReason;
pub use registry::AssemblyRegistry;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AssemblyConfig;
use crate::dispatch::CompletionDispatcher;
use crate::error::AssemblyError;

/// Opaque identity of the user a burst belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immediate answer to a fragment, returned before any downstream work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    /// Position of the fragment within its burst, starting at 1.
    pub part: usize,
    pub text: String,
}

/// The assembly engine: registry, dispatch loop, and janitor with one lifecycle.
///
/// Construct with [`AssemblyEngine::start`] inside a tokio runtime and stop with
/// [`AssemblyEngine::shutdown`], which discards open bursts and waits for
/// dispatches that are already in flight.
pub struct AssemblyEngine {
    config: Arc<AssemblyConfig>,
    registry: Arc<AssemblyRegistry>,
    cancel: CancellationToken,
    dispatches: TaskTracker,
    background: Vec<JoinHandle<()>>,
}

impl AssemblyEngine {
    /// Start the engine on the current tokio runtime.
    pub fn start(config: AssemblyConfig, dispatcher: CompletionDispatcher) -> Self {
        Self::start_on(config, dispatcher, Handle::current())
    }

    /// Start the engine with timers, janitor, and dispatches on `runtime`.
    pub fn start_on(
        config: AssemblyConfig,
        dispatcher: CompletionDispatcher,
        runtime: Handle,
    ) -> Self {
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(AssemblyRegistry::new(
            Arc::clone(&config),
            runtime.clone(),
            tx,
        ));
        let cancel = CancellationToken::new();
        let dispatches = TaskTracker::new();

        let dispatch_loop = runtime.spawn(run_dispatch_loop(
            rx,
            Arc::clone(&registry),
            Arc::new(dispatcher),
            dispatches.clone(),
            cancel.clone(),
        ));
        let janitor = JanitorTask::new(
            Arc::clone(&registry),
            config.janitor_interval(),
            config.janitor_max_age(),
        )
        .spawn(&runtime, cancel.clone());

        tracing::info!(
            debounce_ms = config.debounce_ms,
            max_parts = config.max_parts,
            force_after_ms = config.force_after_ms,
            "assembly engine started"
        );

        Self {
            config,
            registry,
            cancel,
            dispatches,
            background: vec![dispatch_loop, janitor],
        }
    }

    /// Add a fragment to the user's open burst, opening one if needed.
    ///
    /// Returns immediately with an acknowledgement; the reply for the burst is
    /// delivered later by the dispatcher.
    pub fn on_fragment(&self, user: &UserId, text: &str) -> Result<Acknowledgement, AssemblyError> {
        if self.cancel.is_cancelled() {
            return Err(AssemblyError::ShutDown);
        }
        loop {
            let assembler = self.registry.get_or_open(user);
            match assembler.add_part(text) {
                Ok(part) => {
                    return Ok(Acknowledgement {
                        part,
                        text: self.config.ack_text(part),
                    });
                }
                // Closed between lookup and append; the next lookup opens a new burst.
                Err(AssemblyError::Closed { .. }) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    /// Discard the user's in-flight burst without producing a reply.
    ///
    /// Returns `true` if a burst was open.
    pub fn on_interrupt(&self, user: &UserId) -> bool {
        let discarded = self.registry.discard(user);
        if discarded {
            tracing::info!(user = %user, "burst interrupted");
        }
        discarded
    }

    pub fn registry(&self) -> &Arc<AssemblyRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Number of bursts currently open.
    pub fn open_bursts(&self) -> usize {
        self.registry.len()
    }

    /// Discard open bursts, stop background tasks, and wait for in-flight
    /// dispatches to deliver.
    pub async fn shutdown(self) {
        let discarded = self.registry.drain();
        self.cancel.cancel();
        for handle in self.background {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "assembly background task ended abnormally");
            }
        }
        self.dispatches.close();
        self.dispatches.wait().await;
        tracing::info!(discarded, "assembly engine stopped");
    }
}

async fn run_dispatch_loop(
    mut completions: mpsc::UnboundedReceiver<CompletedBurst>,
    registry: Arc<AssemblyRegistry>,
    dispatcher: Arc<CompletionDispatcher>,
    dispatches: TaskTracker,
    cancel: CancellationToken,
) {
    let route = |burst: CompletedBurst| {
        registry.remove(&burst.user, &burst.source);
        tracing::debug!(
            user = %burst.user,
            parts = burst.parts,
            reason = %burst.reason,
            "routing burst to dispatcher"
        );
        let dispatcher = Arc::clone(&dispatcher);
        dispatches.spawn(async move {
            dispatcher.dispatch(&burst.user, &burst.text).await;
        });
    };

    loop {
        tokio::select! {
            burst = completions.recv() => match burst {
                Some(burst) => route(burst),
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }

    // Bursts that closed before the cancel still get their one reply.
    while let Ok(burst) = completions.try_recv() {
        route(burst);
    }
}
