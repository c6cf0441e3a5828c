// SPDX-License-Identifier: Apache-2.0

//! The process-wide in-flight fetch limit. Kept in its own test binary: the
//! limit is installed once per process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;

use waveql::{Capability, Connection, DialectKind, EngineResult, FederationConfig, FragmentEncoding, MemoryTransport};
use waveql_core::traits::{FetchRequest, Page, WriteRequest};
use waveql_core::SourceTransport;

#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Memory source that holds every fetch open for a while and records how
/// many were open at once.
struct GaugedTransport {
    inner: MemoryTransport,
    gauge: Arc<Gauge>,
}

#[async_trait]
impl SourceTransport for GaugedTransport {
    fn source_kind(&self) -> &'static str {
        "gauged"
    }

    fn capabilities(&self) -> Capability {
        self.inner.capabilities()
    }

    async fn fetch(&self, request: &FetchRequest, page_token: Option<&str>) -> EngineResult<Page> {
        let open = self.gauge.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(open, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let page = self.inner.fetch(request, page_token).await;
        self.gauge.in_flight.fetch_sub(1, Ordering::SeqCst);
        page
    }

    async fn write(&self, request: &WriteRequest) -> EngineResult<u64> {
        self.inner.write(request).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_fetches_stay_within_the_limit() {
    assert!(waveql::init_fetch_limit(2));
    assert!(!waveql::init_fetch_limit(5));
    assert_eq!(waveql::fetch_limit(), Some(2));

    let gauge = Arc::new(Gauge::default());
    // A connection asking for more does not raise the installed limit.
    let config = FederationConfig {
        max_in_flight_fetches: 8,
        ..Default::default()
    };
    let mut conn = Connection::new(config);
    for source in ["a", "b", "c", "d"] {
        let capability = Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere).with_page_size(1);
        let records = (0..4).map(|i| json!({"id": i, "source": source})).collect();
        let transport = GaugedTransport {
            inner: MemoryTransport::new(capability).with_table("t", records),
            gauge: gauge.clone(),
        };
        conn = conn.with_source(source, Arc::new(transport));
    }

    let queries = ["a", "b", "c", "d"].map(|source| {
        let conn = &conn;
        async move {
            let sql = format!("SELECT id FROM {source}.t");
            conn.query(&sql).await?.fetch_all().await
        }
    });
    for rows in join_all(queries).await {
        assert_eq!(rows.unwrap().len(), 4);
    }

    assert_eq!(gauge.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
}
