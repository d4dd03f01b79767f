//! ---
//! lreg_section: "01-core-functionality"
//! lreg_subsection: "module"
//! lreg_type: "source"
//! lreg_scope: "code"
//! lreg_description: "Shared primitives and utilities for the registry runtime."
//! lreg_version: "v0.0.0-prealpha"
//! lreg_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};

/// Source of wall-clock time in epoch milliseconds.
///
/// License expiry is evaluated against this clock rather than `Utc::now()`
/// directly so that nodes and tests can pin time.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests and replay.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(now_millis),
        }
    }

    /// Pin the clock at midnight UTC of a `YYYY-MM-DD` date.
    pub fn at_date(date: &str) -> Result<Self> {
        Ok(Self::new(parse_date_millis(date)?))
    }

    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Parse a `YYYY-MM-DD` date into epoch milliseconds at midnight UTC.
pub fn parse_date_millis(date: &str) -> Result<i64> {
    let day = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{date}', expected YYYY-MM-DD"))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .context("midnight is always representable")?;
    Ok(midnight.and_utc().timestamp_millis())
}

/// Render epoch milliseconds as RFC 3339, falling back to the raw number.
pub fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
