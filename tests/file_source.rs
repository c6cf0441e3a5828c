// SPDX-License-Identifier: Apache-2.0

//! Queries over flat files, alone and joined with another source.

use std::fs;
use std::sync::Arc;

use serde_json::json;

use waveql::{Capability, Connection, DialectKind, FileTransport, FragmentEncoding, MemoryTransport, Value};

fn users_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("users.csv"),
        "id,name,score\n1,ann,4.5\n2,bo,2.0\n3,cy,3.5\n",
    )
    .unwrap();
    dir
}

#[tokio::test]
async fn filters_order_and_limit_run_in_the_file_reader() {
    let dir = users_dir();
    let conn = Connection::default().with_source("files", Arc::new(FileTransport::new(dir.path())));

    let sql = "SELECT name, score FROM files.users WHERE score > 3 ORDER BY score DESC LIMIT 1";
    let explained = conn.explain(sql).await.unwrap();
    assert!(explained.contains("native:"));
    assert!(explained.contains("limit: 1"));
    assert!(explained.contains("pass-through"));

    let rows = conn.query(sql).await.unwrap().fetch_all().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values, vec![Value::Text("ann".into()), Value::Float(4.5)]);
}

#[tokio::test]
async fn files_join_other_sources() {
    let dir = users_dir();
    let orders = MemoryTransport::new(Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere)).with_table(
        "orders",
        vec![
            json!({"id": 100, "user_id": 1, "total": 30}),
            json!({"id": 101, "user_id": 3, "total": 10}),
            json!({"id": 102, "user_id": 3, "total": 20}),
        ],
    );
    let conn = Connection::default()
        .with_source("files", Arc::new(FileTransport::new(dir.path())))
        .with_source("crm", Arc::new(orders));

    let mut results = conn
        .query(
            "SELECT u.name, SUM(o.total) AS spent FROM files.users u JOIN crm.orders o ON u.id = o.user_id \
             GROUP BY u.name ORDER BY u.name",
        )
        .await
        .unwrap();
    assert_eq!(results.column_names(), vec!["name", "spent"]);
    let rows = results.to_json_rows().await.unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["ann", "cy"]);
    assert!(rows.iter().all(|r| r["spent"].as_f64() == Some(30.0)));
}

#[tokio::test]
async fn inserts_append_to_csv() {
    let dir = users_dir();
    let conn = Connection::default().with_source("files", Arc::new(FileTransport::new(dir.path())));

    let inserted = conn
        .query("INSERT INTO files.users (id, name, score) VALUES (4, 'dee', 1.5)")
        .await
        .unwrap();
    assert_eq!(inserted.rowcount(), Some(1));

    let rows = conn
        .query("SELECT COUNT(*) FROM files.users")
        .await
        .unwrap()
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(rows[0].values, vec![Value::Int(4)]);

    let mut out = Vec::new();
    let mut results = conn.query("SELECT id, name FROM files.users WHERE id >= 3 ORDER BY id").await.unwrap();
    assert_eq!(results.write_csv(&mut out).await.unwrap(), 2);
    assert_eq!(String::from_utf8(out).unwrap(), "id,name\n3,cy\n4,dee\n");
}
