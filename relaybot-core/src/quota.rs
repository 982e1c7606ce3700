//! In-memory daily request quota.
//!
//! Counts every downstream request per user per UTC day, successful or not.
//! A user is over quota once `used >= limit`. Individual users can carry a
//! different limit (or none at all) via [`DailyQuota::set_limit`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::assembly::UserId;
use crate::dispatch::{QuotaGuard, UsageRecord};

#[derive(Debug, Default)]
struct UserUsage {
    day: Option<NaiveDate>,
    used: u32,
    /// `Some(None)` means unlimited; `None` falls back to the default limit.
    limit: Option<Option<u32>>,
}

impl UserUsage {
    fn used_on(&self, day: NaiveDate) -> u32 {
        if self.day == Some(day) { self.used } else { 0 }
    }

    fn roll_over(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.used = 0;
        }
    }
}

pub struct DailyQuota {
    default_limit: u32,
    usage: Mutex<HashMap<UserId, UserUsage>>,
}

impl DailyQuota {
    pub fn new(default_limit: u32) -> Self {
        Self {
            default_limit,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Override the daily limit for one user. `None` removes the limit.
    pub fn set_limit(&self, user: &UserId, limit: Option<u32>) {
        self.lock().entry(user.clone()).or_default().limit = Some(limit);
    }

    /// Effective limit for `user`, `None` when unlimited.
    pub fn limit_for(&self, user: &UserId) -> Option<u32> {
        self.lock()
            .get(user)
            .and_then(|u| u.limit)
            .unwrap_or(Some(self.default_limit))
    }

    /// Requests the user has made today.
    pub fn used_today(&self, user: &UserId) -> u32 {
        self.used_at(user, Utc::now())
    }

    /// Requests left today, `None` when unlimited.
    pub fn remaining(&self, user: &UserId) -> Option<u32> {
        self.remaining_at(user, Utc::now())
    }

    pub fn remaining_at(&self, user: &UserId, now: DateTime<Utc>) -> Option<u32> {
        let limit = self.limit_for(user)?;
        Some(limit.saturating_sub(self.used_at(user, now)))
    }

    pub fn is_exceeded_at(&self, user: &UserId, now: DateTime<Utc>) -> bool {
        self.remaining_at(user, now) == Some(0)
    }

    pub fn record_at(&self, user: &UserId, now: DateTime<Utc>) {
        let mut usage = self.lock();
        let entry = usage.entry(user.clone()).or_default();
        entry.roll_over(now.date_naive());
        entry.used = entry.used.saturating_add(1);
    }

    /// Count one request for `user` unless the limit is already reached.
    ///
    /// The check and the increment share one lock acquisition.
    pub fn try_reserve_at(&self, user: &UserId, now: DateTime<Utc>) -> bool {
        let mut usage = self.lock();
        let entry = usage.entry(user.clone()).or_default();
        entry.roll_over(now.date_naive());
        let limit = entry.limit.unwrap_or(Some(self.default_limit));
        if limit.is_some_and(|limit| entry.used >= limit) {
            return false;
        }
        entry.used = entry.used.saturating_add(1);
        true
    }

    fn used_at(&self, user: &UserId, now: DateTime<Utc>) -> u32 {
        self.lock()
            .get(user)
            .map(|u| u.used_on(now.date_naive()))
            .unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, UserUsage>> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QuotaGuard for DailyQuota {
    async fn try_reserve(&self, user: &UserId) -> bool {
        self.try_reserve_at(user, Utc::now())
    }

    /// The request was already counted by `try_reserve`.
    async fn record_usage(&self, user: &UserId, record: UsageRecord) {
        tracing::debug!(
            user = %user,
            successful = record.successful,
            tokens = ?record.token_count,
            "usage recorded"
        );
    }
}
