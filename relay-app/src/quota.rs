//! Daily message quotas, one shared counter per chat scope.
//!
//! Counters reset lazily: the first call on a later local day zeroes the
//! counter before counting itself. Every call counts, admitted or not.

use chrono::{DateTime, Local, NaiveDate, TimeZone};
use relay_channels::ChatScope;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Calls counted today in this scope, including this one.
    pub count: u32,
    pub limit: u32,
}

#[derive(Debug)]
struct DailyCounter {
    count: u32,
    day: NaiveDate,
}

impl DailyCounter {
    fn new(day: NaiveDate) -> Self {
        Self { count: 0, day }
    }

    fn admit(&mut self, limit: u32, today: NaiveDate) -> Admission {
        if today > self.day {
            self.count = 0;
            self.day = today;
        }
        self.count = self.count.saturating_add(1);
        Admission {
            admitted: limit >= self.count,
            count: self.count,
            limit,
        }
    }
}

#[derive(Debug)]
pub struct QuotaTracker {
    private: Mutex<DailyCounter>,
    group: Mutex<DailyCounter>,
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::starting_on(Local::now().date_naive())
    }

    pub fn starting_on(day: NaiveDate) -> Self {
        Self {
            private: Mutex::new(DailyCounter::new(day)),
            group: Mutex::new(DailyCounter::new(day)),
        }
    }

    /// Counts one message in `scope` and reports whether it fits under `limit`.
    pub fn admit(&self, scope: ChatScope, limit: u32) -> Admission {
        self.admit_at(scope, limit, &Local::now())
    }

    pub fn admit_at<Tz: TimeZone>(
        &self,
        scope: ChatScope,
        limit: u32,
        now: &DateTime<Tz>,
    ) -> Admission {
        let mut counter = self
            .counter(scope)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let admission = counter.admit(limit, now.date_naive());
        tracing::debug!(
            %scope,
            count = admission.count,
            limit,
            admitted = admission.admitted,
            "quota checked"
        );
        admission
    }

    pub fn count(&self, scope: ChatScope) -> u32 {
        self.counter(scope)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .count
    }

    fn counter(&self, scope: ChatScope) -> &Mutex<DailyCounter> {
        match scope {
            ChatScope::Private => &self.private,
            ChatScope::Group => &self.group,
        }
    }
}
