//! Registry of live assemblers, at most one OPEN instance per user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::UserId;
use super::assembler::{Assembler, CompletedBurst};
use crate::config::AssemblyConfig;

/// Maps each user to their currently open [`Assembler`].
///
/// The map lock is held only for O(1) lookups and swaps; fragment appends
/// happen on the assembler's own lock, so users never contend with each other
/// beyond the map access.
pub struct AssemblyRegistry {
    live: Mutex<HashMap<UserId, Arc<Assembler>>>,
    config: Arc<AssemblyConfig>,
    timers: Handle,
    completions: mpsc::UnboundedSender<CompletedBurst>,
}

impl AssemblyRegistry {
    pub fn new(
        config: Arc<AssemblyConfig>,
        timers: Handle,
        completions: mpsc::UnboundedSender<CompletedBurst>,
    ) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            config,
            timers,
            completions,
        }
    }

    /// Return the user's open assembler, opening a new one if there is none
    /// or the mapped one has already closed.
    pub fn get_or_open(&self, user: &UserId) -> Arc<Assembler> {
        let mut live = self.lock();
        if let Some(existing) = live.get(user) {
            if existing.is_open() {
                return Arc::clone(existing);
            }
            tracing::debug!(user = %user, "previous burst closed, opening a new one");
        }
        let assembler = Arc::new(Assembler::new(
            user.clone(),
            Arc::clone(&self.config),
            self.timers.clone(),
            self.completions.clone(),
        ));
        live.insert(user.clone(), Arc::clone(&assembler));
        tracing::debug!(user = %user, "assembler opened");
        assembler
    }

    /// Close and evict the user's assembler without dispatching it.
    ///
    /// Returns `true` if an open burst was discarded.
    pub fn discard(&self, user: &UserId) -> bool {
        let removed = self.lock().remove(user);
        match removed {
            Some(assembler) => assembler.mark_closed(),
            None => false,
        }
    }

    /// Evict `instance` only if it is still the one mapped for `user`.
    pub fn remove(&self, user: &UserId, instance: &Arc<Assembler>) -> bool {
        let mut live = self.lock();
        match live.get(user) {
            Some(current) if Arc::ptr_eq(current, instance) => {
                live.remove(user);
                true
            }
            _ => false,
        }
    }

    /// Force-close and evict every assembler open for longer than `max_age`.
    ///
    /// Returns the users whose bursts were retired.
    pub fn sweep_expired(&self, now: Instant, max_age: Duration) -> Vec<UserId> {
        let expired: Vec<Arc<Assembler>> = {
            let mut live = self.lock();
            let users: Vec<UserId> = live
                .iter()
                .filter(|(_, a)| now.saturating_duration_since(a.opened_at()) > max_age)
                .map(|(user, _)| user.clone())
                .collect();
            users.iter().filter_map(|user| live.remove(user)).collect()
        };

        expired
            .into_iter()
            .map(|assembler| {
                assembler.mark_closed();
                assembler.owner().clone()
            })
            .collect()
    }

    /// Discard every live burst. Used at shutdown.
    pub fn drain(&self) -> usize {
        let drained: Vec<Arc<Assembler>> = self.lock().drain().map(|(_, a)| a).collect();
        drained
            .iter()
            .filter(|assembler| assembler.mark_closed())
            .count()
    }

    pub fn get(&self, user: &UserId) -> Option<Arc<Assembler>> {
        self.lock().get(user).cloned()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.lock().contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Arc<Assembler>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
