// SPDX-License-Identifier: Apache-2.0

//! End-to-end federation scenarios over in-process sources.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use waveql::federation::{Finish, Plan};
use waveql::{
    Capability, Connection, DataType, DialectKind, EngineError, FederationConfig, FragmentEncoding,
    MemoryTransport, TableKey, Value,
};
use waveql_core::capability::PredicateShape;
use waveql_core::predicate::{CompareOp, Literal, Predicate};
use waveql_core::schema::SchemaChange;

fn sql_capability() -> Capability {
    Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere)
}

fn servicenow_capability() -> Capability {
    Capability::none(
        DialectKind::ServiceNow,
        FragmentEncoding::QueryParam {
            name: "sysparm_query".into(),
        },
    )
    .with_shapes([PredicateShape::Compare(CompareOp::LtEq)])
}

fn crm() -> MemoryTransport {
    MemoryTransport::new(sql_capability()).with_table(
        "users",
        vec![
            json!({"id": 1, "name": "ann", "tier": "gold"}),
            json!({"id": 2, "name": "bo", "tier": "silver"}),
            json!({"id": 3, "name": "cy", "tier": "gold"}),
        ],
    )
}

fn billing() -> MemoryTransport {
    MemoryTransport::new(sql_capability()).with_table(
        "invoices",
        vec![
            json!({"id": 10, "user_id": 1, "amount": 5.0}),
            json!({"id": 11, "user_id": 2, "amount": 7.5}),
            json!({"id": 12, "user_id": 3, "amount": 1.0}),
            json!({"id": 13, "user_id": 9, "amount": 99.0}),
            json!({"id": 14, "user_id": 1, "amount": 2.5}),
        ],
    )
}

fn incidents() -> MemoryTransport {
    MemoryTransport::new(servicenow_capability()).with_table(
        "incident",
        vec![
            json!({"number": "INC001", "priority": 1, "assignee": "bob"}),
            json!({"number": "INC002", "priority": 2, "assignee": "amy"}),
            json!({"number": "INC003", "priority": 2, "assignee": "bob"}),
            json!({"number": "INC004", "priority": 4, "assignee": "bob"}),
        ],
    )
}

fn text(value: &Value) -> &str {
    match value {
        Value::Text(s) => s,
        other => panic!("expected text, got {other:?}"),
    }
}

#[tokio::test]
async fn semi_join_pushes_driver_keys() {
    let crm = Arc::new(crm());
    let billing = Arc::new(billing());
    let conn = Connection::default()
        .with_source("crm", crm.clone())
        .with_source("billing", billing.clone());

    let sql = "SELECT u.name, i.amount FROM crm.users u JOIN billing.invoices i ON u.id = i.user_id";
    let plan = conn.plan(&conn.prepare(sql).unwrap()).await.unwrap();
    let Plan::Select(select) = &plan else {
        panic!("expected a select plan");
    };
    assert!(select.steps[1].semi_join.is_some());

    let mut results = conn.execute(&plan).await.unwrap();
    let rows = results.fetch_all().await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| text(&r.values[0]) != ""));

    // The last request to billing is the restricted fetch.
    let last = billing.requests().pop().unwrap();
    match last.filter {
        Some(Predicate::In { column, values }) => {
            assert_eq!(column.dotted(), "user_id");
            assert_eq!(values, vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
        }
        other => panic!("expected an IN filter, got {other:?}"),
    }
    let summary = results.summary().unwrap();
    assert_eq!(summary.steps.len(), 2);
    assert!(summary.warnings.is_empty());
}

#[tokio::test]
async fn semi_join_with_no_keys_skips_the_fetch() {
    let billing = Arc::new(billing());
    let conn = Connection::default()
        .with_source("crm", Arc::new(crm()))
        .with_source("billing", billing.clone());

    let mut results = conn
        .query("SELECT u.name, i.amount FROM crm.users u JOIN billing.invoices i ON u.id = i.user_id WHERE u.tier = 'platinum'")
        .await
        .unwrap();
    assert!(results.fetch_all().await.unwrap().is_empty());
    let summary = results.summary().unwrap();
    assert!(summary.steps.iter().any(|s| s.skipped));
    // Only the schema sample reached billing.
    assert_eq!(billing.requests().len(), 1);
}

#[tokio::test]
async fn too_many_keys_fall_back_to_a_full_fetch() {
    let billing = Arc::new(
        MemoryTransport::new(sql_capability().with_max_in_list(2))
            .with_table("invoices", billing().records("invoices")),
    );
    let conn = Connection::default()
        .with_source("crm", Arc::new(crm()))
        .with_source("billing", billing.clone());

    let mut results = conn
        .query("SELECT u.name, i.amount FROM crm.users u JOIN billing.invoices i ON u.id = i.user_id")
        .await
        .unwrap();
    assert_eq!(results.fetch_all().await.unwrap().len(), 4);
    assert!(billing.requests().pop().unwrap().filter.is_none());
    assert_eq!(results.warnings().len(), 1);
    assert!(results.warnings()[0].contains("more than 2 distinct keys"));
}

#[tokio::test]
async fn limit_is_not_pushed_under_a_cross_source_join() {
    let crm = Arc::new(crm());
    let billing = Arc::new(billing());
    let conn = Connection::default()
        .with_source("crm", crm.clone())
        .with_source("billing", billing.clone());

    let sql = "SELECT u.name FROM crm.users u JOIN billing.invoices i ON u.id = i.user_id LIMIT 2";
    let plan = conn.plan(&conn.prepare(sql).unwrap()).await.unwrap();
    let Plan::Select(select) = &plan else {
        panic!("expected a select plan");
    };
    assert!(select.steps.iter().all(|s| s.request.limit.is_none()));
    assert!(matches!(select.finish, Finish::Local(_)));

    let rows = conn.execute(&plan).await.unwrap().fetch_all().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(crm.requests().iter().all(|r| r.limit.is_none()));
    assert!(billing.requests().iter().all(|r| r.limit.is_none()));
}

#[tokio::test]
async fn partial_pushdown_filters_the_rest_locally() {
    let sn = Arc::new(incidents());
    let conn = Connection::default().with_source("sn", sn.clone());

    let mut results = conn
        .query("SELECT number FROM sn.incident WHERE priority <= 2 AND assignee = 'bob'")
        .await
        .unwrap();
    let numbers: Vec<String> = results
        .fetch_all()
        .await
        .unwrap()
        .iter()
        .map(|r| text(&r.values[0]).to_string())
        .collect();
    assert_eq!(numbers, vec!["INC001", "INC003"]);

    let last = sn.requests().pop().unwrap();
    assert_eq!(last.fragment.unwrap().text, "priority<=2");
}

#[tokio::test]
async fn same_source_joins_and_aggregates_are_pushed() {
    let shop = Arc::new(
        MemoryTransport::new(sql_capability())
            .with_table("users", crm().records("users"))
            .with_table("invoices", billing().records("invoices")),
    );
    let conn = Connection::default().with_source("shop", shop.clone());

    let rows = conn
        .query("SELECT u.name, i.amount FROM shop.users u JOIN shop.invoices i ON u.id = i.user_id WHERE i.amount > 2")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(shop.requests().pop().unwrap().joins.len(), 1);

    let rows = conn
        .query("SELECT user_id, COUNT(*) FROM shop.invoices GROUP BY user_id ORDER BY user_id")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].values, vec![Value::Int(1), Value::Int(2)]);
    assert!(shop.requests().pop().unwrap().aggregate.is_some());
}

#[tokio::test]
async fn writes_reach_the_source() {
    let crm = Arc::new(crm());
    let conn = Connection::default()
        .with_source("crm", crm.clone())
        .with_source("sn", Arc::new(incidents()));

    let inserted = conn
        .query("INSERT INTO crm.users (id, name, tier) VALUES (4, 'dee', 'gold')")
        .await
        .unwrap();
    assert_eq!(inserted.rowcount(), Some(1));
    assert_eq!(crm.records("users").len(), 4);

    let updated = conn
        .query("UPDATE crm.users SET tier = 'silver' WHERE tier = 'gold'")
        .await
        .unwrap();
    assert_eq!(updated.rowcount(), Some(3));

    let deleted = conn.query("DELETE FROM crm.users WHERE id = 4").await.unwrap();
    assert_eq!(deleted.rowcount(), Some(1));

    let err = conn
        .query("DELETE FROM sn.incident WHERE assignee = 'bob'")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::QueryError { .. }));
}

#[tokio::test]
async fn cancellation_leaves_other_queries_alone() {
    let slow = Arc::new(
        MemoryTransport::new(sql_capability())
            .with_table("events", vec![json!({"id": 1}), json!({"id": 2})]),
    );
    let conn = Connection::default()
        .with_source("crm", Arc::new(crm()))
        .with_source("slow", slow.clone());

    // Cache both schemas before the slow source starts lagging.
    conn.query("SELECT id FROM slow.events").await.unwrap().fetch_all().await.unwrap();
    conn.query("SELECT id FROM crm.users").await.unwrap().fetch_all().await.unwrap();
    let lagging = Arc::new(
        MemoryTransport::new(sql_capability())
            .with_table("events", slow.records("events"))
            .with_latency(Duration::from_secs(30)),
    );
    conn.register_source("slow", lagging);
    conn.registry()
        .publish(TableKey::new("slow", "events"), waveql_core::schema::infer(&slow.records("events"), 100));
    let cached = conn.registry().len();
    let before = waveql::metrics::snapshot();

    let mut pending = conn.query("SELECT id FROM slow.events").await.unwrap();

    let names = conn
        .query("SELECT name FROM crm.users WHERE id = 2")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(names.len(), 1);

    pending.cancel();
    assert!(matches!(pending.next_row().await, Err(EngineError::Cancelled)));

    assert_eq!(conn.registry().len(), cached);
    assert!(conn.registry().get(&TableKey::new("crm", "users")).is_some());
    assert!(conn.registry().get(&TableKey::new("slow", "events")).is_some());
    assert!(waveql::metrics::snapshot().cancelled > before.cancelled);

    // The connection keeps serving queries.
    let again = conn.query("SELECT id FROM crm.users").await.unwrap().fetch_all().await.unwrap();
    assert_eq!(again.len(), 3);
}

#[tokio::test]
async fn slow_fetches_time_out() {
    let config = FederationConfig {
        fetch_timeout_ms: 50,
        ..Default::default()
    };
    let slow = MemoryTransport::new(sql_capability())
        .with_table("events", vec![json!({"id": 1})])
        .with_latency(Duration::from_millis(500));
    let conn = Connection::new(config).with_source("slow", Arc::new(slow));

    let err = conn.query("SELECT id FROM slow.events").await.err().unwrap();
    assert!(matches!(err, EngineError::Timeout { timeout_ms: 50 }));
}

#[tokio::test]
async fn fatal_transport_errors_mark_the_source_failed() {
    let crm = Arc::new(crm());
    let conn = Connection::default().with_source("crm", crm.clone());
    conn.query("SELECT id FROM crm.users").await.unwrap().fetch_all().await.unwrap();

    crm.fail_with(EngineError::transport_fatal("memory", "HTTP 401"));
    let err = conn
        .query("SELECT id FROM crm.users")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap_err();
    match err {
        EngineError::Transport {
            source_id, retryable, ..
        } => {
            assert_eq!(source_id, "crm");
            assert!(!retryable);
        }
        other => panic!("expected a transport error, got {other:?}"),
    }
    assert!(conn.sources()[0].failure.is_some());

    crm.recover();
    assert!(conn.query("SELECT id FROM crm.users").await.is_err());
    assert!(conn.reset_source("crm"));
    let rows = conn.query("SELECT id FROM crm.users").await.unwrap().fetch_all().await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn row_limits_are_reported() {
    let config = FederationConfig {
        row_limit_per_source: Some(2),
        ..Default::default()
    };
    let conn = Connection::new(config).with_source("crm", Arc::new(crm()));

    let mut results = conn.query("SELECT id FROM crm.users").await.unwrap();
    assert_eq!(results.fetch_all().await.unwrap().len(), 2);
    assert!(results.warnings()[0].contains("returned the maximum 2 rows"));
    assert!(results.summary().unwrap().steps[0].row_limit_hit);
}

#[tokio::test]
async fn schema_drift_is_detected_in_strict_mode() {
    let crm = Arc::new(crm());
    let config = FederationConfig {
        evolution: waveql::EvolutionStrategy::Strict,
        ..Default::default()
    };
    let conn = Connection::new(config).with_source("crm", crm.clone());
    conn.registry().publish(
        TableKey::new("crm", "users"),
        waveql_core::schema::infer(&[json!({"id": 1, "name": "ann"})], 100),
    );

    let err = conn
        .query("SELECT id FROM crm.users")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SchemaEvolution { .. }));

    assert!(conn.invalidate_schema("crm", "users"));
    let rows = conn.query("SELECT tier FROM crm.users").await.unwrap().fetch_all().await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn exact_row_limits_are_not_truncations() {
    let config = FederationConfig {
        row_limit_per_source: Some(3),
        ..Default::default()
    };
    let conn = Connection::new(config).with_source("crm", Arc::new(crm()));

    let mut results = conn.query("SELECT id FROM crm.users").await.unwrap();
    assert_eq!(results.fetch_all().await.unwrap().len(), 3);
    assert!(results.warnings().is_empty());
    assert!(!results.summary().unwrap().steps[0].row_limit_hit);
}

/// 200 integer scores with one float the schema sample skips (indices 0, 2, 4, ...).
fn sparse_scores(capability: Capability) -> MemoryTransport {
    let mut records: Vec<_> = (0..200).map(|i| json!({"id": i, "score": i})).collect();
    records[1] = json!({"id": 1, "score": 2.5});
    MemoryTransport::new(capability).with_table("readings", records)
}

#[tokio::test]
async fn unsampled_values_widen_the_schema() {
    let conn = Connection::default().with_source("m", Arc::new(sparse_scores(sql_capability())));

    for _ in 0..2 {
        let mut results = conn.query("SELECT id, score FROM m.readings").await.unwrap();
        let rows = results.fetch_all().await.unwrap();
        assert_eq!(rows.len(), 200);
        assert_eq!(rows[1].values[1], Value::Float(2.5));
        assert_eq!(rows[2].values[1], Value::Float(2.0));
        assert_eq!(results.description().columns[1].data_type, DataType::Float);
    }

    let published = conn.registry().get(&TableKey::new("m", "readings")).unwrap();
    assert_eq!(published.column("score").unwrap().data_type, DataType::Float);
}

#[tokio::test]
async fn widening_reaches_the_local_stage() {
    let capability = Capability::none(DialectKind::Sql, FragmentEncoding::SqlWhere);
    let conn = Connection::default().with_source("m", Arc::new(sparse_scores(capability)));

    let rows = conn
        .query("SELECT SUM(score) AS total FROM m.readings")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap();
    // 0 + 1 + ... + 199, with 1 replaced by 2.5
    assert_eq!(rows[0].values, vec![Value::Float(19901.5)]);
}

#[tokio::test]
async fn strict_mode_reports_what_the_record_changes() {
    let config = FederationConfig {
        evolution: waveql::EvolutionStrategy::Strict,
        ..Default::default()
    };
    let conn = Connection::new(config).with_source("m", Arc::new(sparse_scores(sql_capability())));

    let err = conn
        .query("SELECT id, score FROM m.readings")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap_err();
    match err {
        EngineError::SchemaEvolution { changes, .. } => assert_eq!(
            changes,
            vec![SchemaChange::TypeChanged {
                path: "score".into(),
                old: DataType::Integer,
                new: DataType::Float,
            }]
        ),
        other => panic!("expected a schema evolution error, got {other:?}"),
    }
}
