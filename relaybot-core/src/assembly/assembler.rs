//! Per-user fragment buffer with a self-rescheduling completion check.
//!
//! An [`Assembler`] is OPEN while it accepts fragments and CLOSED once it has
//! either completed (and emitted exactly one [`CompletedBurst`]) or been
//! discarded. The OPEN -> CLOSED transition is a compare-and-set on an atomic
//! state, so a firing check and a janitor sweep racing on the same instance
//! produce exactly one winner.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::UserId;
use super::policy::{self, CompletionReason};
use crate::config::AssemblyConfig;
use crate::error::AssemblyError;

/// Lifecycle state of an assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AssemblerState {
    Open = 0,
    Closed = 1,
}

impl AssemblerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for AssemblerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A finished burst, handed to the dispatch loop exactly once.
#[derive(Debug, Clone)]
pub struct CompletedBurst {
    pub user: UserId,
    pub text: String,
    pub parts: usize,
    pub reason: CompletionReason,
    pub open_for: Duration,
    /// The instance that produced this burst, for identity-checked eviction.
    pub source: Arc<Assembler>,
}

struct PendingCheck {
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct Inner {
    buffer: String,
    parts: usize,
    last_fragment_at: Instant,
    armed_window: Duration,
    generation: u64,
    pending: Option<PendingCheck>,
}

/// Buffers fragments for one user until the completion policy fires.
pub struct Assembler {
    owner: UserId,
    opened_at: Instant,
    state: AtomicU8,
    inner: Mutex<Inner>,
    config: Arc<AssemblyConfig>,
    timers: Handle,
    completions: mpsc::UnboundedSender<CompletedBurst>,
}

impl std::fmt::Debug for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assembler")
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("parts", &self.parts_count())
            .finish()
    }
}

impl Assembler {
    pub fn new(
        owner: UserId,
        config: Arc<AssemblyConfig>,
        timers: Handle,
        completions: mpsc::UnboundedSender<CompletedBurst>,
    ) -> Self {
        let now = Instant::now();
        Self {
            owner,
            opened_at: now,
            state: AtomicU8::new(AssemblerState::Open as u8),
            inner: Mutex::new(Inner {
                buffer: String::new(),
                parts: 0,
                last_fragment_at: now,
                armed_window: config.debounce(),
                generation: 0,
                pending: None,
            }),
            config,
            timers,
            completions,
        }
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn state(&self) -> AssemblerState {
        AssemblerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == AssemblerState::Open
    }

    pub fn parts_count(&self) -> usize {
        self.lock().parts
    }

    pub fn last_fragment_at(&self) -> Instant {
        self.lock().last_fragment_at
    }

    /// Current buffer content.
    pub fn assembled_text(&self) -> String {
        self.lock().buffer.clone()
    }

    /// Append a fragment and re-arm the completion check.
    ///
    /// Returns the fragment's part number. Never blocks beyond the buffer
    /// append; the check runs on the timer runtime.
    pub fn add_part(self: &Arc<Self>, fragment: &str) -> Result<usize, AssemblyError> {
        let mut inner = self.lock();
        if !self.is_open() {
            return Err(AssemblyError::Closed {
                user: self.owner.to_string(),
            });
        }

        let now = Instant::now();
        let part = fragment.trim();
        if !part.is_empty() {
            if !inner.buffer.is_empty() {
                inner.buffer.push(' ');
            }
            inner.buffer.push_str(part);
        }
        inner.parts += 1;
        inner.last_fragment_at = now;

        tracing::info!(
            user = %self.owner,
            part = inner.parts,
            len = part.len(),
            total_len = inner.buffer.len(),
            "fragment received"
        );
        tracing::debug!(user = %self.owner, content = part, "fragment content");

        let arm = policy::arm(&self.config, self.opened_at, inner.parts, now);
        let keep_pending = arm.forced
            && inner
                .pending
                .as_ref()
                .is_some_and(|pending| pending.deadline <= arm.deadline);

        if keep_pending {
            tracing::debug!(user = %self.owner, "forced check already armed, keeping it");
        } else {
            inner.armed_window = arm.window;
            self.schedule_check(&mut inner, arm.deadline);
            tracing::debug!(
                user = %self.owner,
                delay_ms = arm.deadline.saturating_duration_since(now).as_millis() as u64,
                forced = arm.forced,
                "completion check scheduled"
            );
        }

        Ok(inner.parts)
    }

    /// Evaluate the completion policy. Called only by a fired check.
    fn try_complete(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if !self.is_open() || inner.generation != generation {
            return;
        }

        let now = Instant::now();
        let reason = policy::completion_reason(
            &self.config,
            self.opened_at,
            inner.last_fragment_at,
            inner.parts,
            inner.armed_window,
            now,
        );

        let Some(reason) = reason else {
            let deadline = policy::recheck_deadline(
                &self.config,
                self.opened_at,
                inner.last_fragment_at,
                inner.armed_window,
                now,
            );
            tracing::debug!(
                user = %self.owner,
                wait_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                "burst not complete yet"
            );
            inner.pending = None;
            self.schedule_check(&mut inner, deadline);
            return;
        };

        if !self.transition_to_closed() {
            return;
        }
        // This task is the pending check; dropping its handle detaches it.
        inner.pending = None;
        let text = std::mem::take(&mut inner.buffer);
        let parts = inner.parts;
        drop(inner);

        let open_for = now.saturating_duration_since(self.opened_at);
        tracing::info!(
            user = %self.owner,
            parts,
            len = text.len(),
            reason = %reason,
            open_ms = open_for.as_millis() as u64,
            "burst complete"
        );

        let burst = CompletedBurst {
            user: self.owner.clone(),
            text,
            parts,
            reason,
            open_for,
            source: Arc::clone(self),
        };
        if self.completions.send(burst).is_err() {
            tracing::warn!(user = %self.owner, "dispatch loop stopped, burst dropped");
        }
    }

    /// Force the instance closed without dispatching. Idempotent.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn mark_closed(&self) -> bool {
        let mut inner = self.lock();
        let closed = self.transition_to_closed();
        if let Some(pending) = inner.pending.take() {
            pending.handle.abort();
        }
        if closed {
            tracing::info!(user = %self.owner, parts = inner.parts, "burst discarded");
        }
        closed
    }

    fn transition_to_closed(&self) -> bool {
        self.state
            .compare_exchange(
                AssemblerState::Open as u8,
                AssemblerState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Supersede any pending check with a new one firing at `deadline`.
    fn schedule_check(self: &Arc<Self>, inner: &mut Inner, deadline: Instant) {
        if let Some(previous) = inner.pending.take() {
            previous.handle.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        let this = Arc::clone(self);
        let handle = self.timers.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            this.try_complete(generation);
        });
        inner.pending = Some(PendingCheck {
            deadline,
            handle,
        });
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
