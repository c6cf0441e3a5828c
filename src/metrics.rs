// SPDX-License-Identifier: Apache-2.0

//! Process-wide query counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct QueryMetrics {
    total: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    pages: AtomicU64,
    rows: AtomicU64,
}

static QUERY_METRICS: OnceLock<QueryMetrics> = OnceLock::new();

fn metrics() -> &'static QueryMetrics {
    QUERY_METRICS.get_or_init(QueryMetrics::default)
}

pub fn record_query(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.total.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);
    metrics.duration_max_ms.fetch_max(duration_ms, Ordering::Relaxed);
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// One fetched page and the rows it contributed after residual filtering.
pub fn record_page(rows: u64) {
    let metrics = metrics();
    metrics.pages.fetch_add(1, Ordering::Relaxed);
    metrics.rows.fetch_add(rows, Ordering::Relaxed);
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetricsSnapshot {
    pub total: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
    pub pages: u64,
    pub rows: u64,
}

pub fn snapshot() -> QueryMetricsSnapshot {
    let metrics = metrics();
    let total = metrics.total.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    QueryMetricsSnapshot {
        total,
        failed: metrics.failed.load(Ordering::Relaxed),
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        avg_ms: (total > 0).then(|| duration_total as f64 / total as f64),
        max_ms: (max_ms > 0).then_some(max_ms),
        pages: metrics.pages.load(Ordering::Relaxed),
        rows: metrics.rows.load(Ordering::Relaxed),
    }
}
