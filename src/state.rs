//! # Application State Management
//!
//! State shared by every HTTP handler and websocket actor.
//!
//! ## What lives here:
//! - **Configuration**: the current `AppConfig`, replaceable at runtime through
//!   `PUT /api/v1/config`. Sessions copy what they need when they start.
//! - **Gateway metrics**: counters folded in from finished sessions.
//! - **Start time**: for uptime reporting.
//!
//! No registry of live sessions is kept; sessions share nothing with each
//! other, only aggregate counters end up here.
//!
//! ## Locking:
//! - `Arc<RwLock<AppConfig>>`: many readers, an occasional writer
//! - Metrics are plain atomics, so recording a session report never blocks
//!   a request handler

use crate::config::AppConfig;
use crate::session::{SessionReport, Termination};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

/// Shared application state. Cheap to clone: every field is behind an `Arc`
/// or is `Copy`.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Current configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Gateway-wide session counters
    pub metrics: Arc<GatewayMetrics>,

    /// When the server started
    pub start_time: Instant,
}

/// Aggregate counters over all sessions since startup.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    active_sessions: AtomicU64,
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_client_closed: AtomicU64,
    sessions_byte_limited: AtomicU64,
    sessions_failed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_forwarded: AtomicU64,
    bytes_delivered: AtomicU64,
    chunks_dropped: AtomicU64,

    /// Failed sessions per error code (e.g. "invalid_format")
    failures_by_code: Mutex<HashMap<&'static str, u64>>,
}

/// Point-in-time copy of `GatewayMetrics`, ready to serialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_client_closed: u64,
    pub sessions_byte_limited: u64,
    pub sessions_failed: u64,
    pub bytes_received: u64,
    pub bytes_forwarded: u64,
    pub bytes_delivered: u64,
    pub chunks_dropped: u64,
    pub failures_by_code: HashMap<String, u64>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(GatewayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately. A poisoned lock still holds a
    /// valid config (writers only ever swap in validated values), so it is
    /// read through.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl GatewayMetrics {
    /// Called when a websocket session starts.
    pub fn session_opened(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished session into the totals.
    pub fn record_report(&self, report: &SessionReport) {
        // Saturating: never wrap below zero if a report arrives without a matching open
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));

        self.bytes_received
            .fetch_add(report.bytes_received, Ordering::Relaxed);
        self.bytes_forwarded
            .fetch_add(report.bytes_forwarded, Ordering::Relaxed);
        self.bytes_delivered
            .fetch_add(report.bytes_delivered, Ordering::Relaxed);
        self.chunks_dropped
            .fetch_add(report.chunks_dropped, Ordering::Relaxed);

        let counter = match &report.reason {
            Termination::Completed => &self.sessions_completed,
            Termination::ClientClosed => &self.sessions_client_closed,
            Termination::ByteLimit => &self.sessions_byte_limited,
            Termination::Failed(err) => {
                let mut failures = self
                    .failures_by_code
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                *failures.entry(err.code()).or_default() += 1;
                &self.sessions_failed
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let failures_by_code = self
            .failures_by_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect();

        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_client_closed: self.sessions_client_closed.load(Ordering::Relaxed),
            sessions_byte_limited: self.sessions_byte_limited.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            bytes_delivered: self.bytes_delivered.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            failures_by_code,
        }
    }
}
