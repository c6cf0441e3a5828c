// SPDX-License-Identifier: Apache-2.0

//! Flat-file source: every CSV, JSON, JSONL or Parquet file under a root
//! directory is a table named after its file stem.
//!
//! Reads go through DuckDB's file readers on a fresh in-memory connection
//! per page, so filters, aggregates, joins and ordering are all evaluated
//! by DuckDB itself.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use duckdb::Connection;
use tracing::{debug, instrument};

use waveql_core::capability::{Capability, DialectKind, FragmentEncoding};
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{ColumnRef, Literal};
use waveql_core::traits::{FetchRequest, Page, SourceTransport, WriteOperation, WriteRequest};
use waveql_sql::pushdown::dialects::sql::{quote_ident, quote_string, render_column};

use crate::duck;

const KIND: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Csv,
    Json,
    Parquet,
}

impl FileFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(FileFormat::Csv),
            "json" | "jsonl" | "ndjson" => Some(FileFormat::Json),
            "parquet" => Some(FileFormat::Parquet),
            _ => None,
        }
    }

    fn reader(&self, path: &Path) -> String {
        let path = quote_string(&path.to_string_lossy());
        match self {
            FileFormat::Csv => format!("read_csv_auto({path})"),
            FileFormat::Json => format!("read_json_auto({path})"),
            FileFormat::Parquet => format!("read_parquet({path})"),
        }
    }
}

pub struct FileTransport {
    root: PathBuf,
    capability: Capability,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            capability: Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, table: &str) -> EngineResult<(PathBuf, FileFormat)> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            EngineError::transport_fatal(KIND, format!("cannot read {}: {e}", self.root.display()))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let format = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(FileFormat::from_extension);
            let stem = path.file_stem().and_then(|s| s.to_str());
            if let (Some(format), Some(stem)) = (format, stem) {
                if stem == table {
                    return Ok((path, format));
                }
            }
        }
        Err(EngineError::transport_fatal(
            KIND,
            format!("no file for table '{table}' under {}", self.root.display()),
        ))
    }

    /// SELECT evaluating the whole request, before pagination.
    fn select_sql(&self, request: &FetchRequest) -> EngineResult<String> {
        let (path, format) = self.locate(&request.table)?;
        let mut from = format!("{} AS {}", format.reader(&path), quote_ident(&request.alias));
        for join in &request.joins {
            let (path, format) = self.locate(&join.table)?;
            let on = join
                .on
                .iter()
                .map(|(a, b)| format!("{} = {}", render_column(a), render_column(b)))
                .collect::<Vec<_>>()
                .join(" AND ");
            from.push_str(&format!(
                " JOIN {} AS {} ON {on}",
                format.reader(&path),
                quote_ident(&join.alias)
            ));
        }

        let projection = if let Some(aggregate) = &request.aggregate {
            let mut items: Vec<String> = aggregate
                .group_by
                .iter()
                .map(|g| format!("{} AS {}", dotted_column(g), quote_ident(g)))
                .collect();
            for call in &aggregate.aggregates {
                let arg = call.column.as_deref().map(dotted_column).unwrap_or_else(|| "*".into());
                items.push(format!("{}({arg}) AS {}", call.func.name(), quote_ident(&call.output)));
            }
            items.join(", ")
        } else if !request.joins.is_empty() {
            // One struct column per table alias.
            std::iter::once(&request.alias)
                .chain(request.joins.iter().map(|j| &j.alias))
                .map(|alias| quote_ident(alias))
                .collect::<Vec<_>>()
                .join(", ")
        } else if request.columns.is_empty() {
            "*".to_string()
        } else {
            request
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {projection} FROM {from}");
        if let Some(fragment) = &request.fragment {
            if fragment.encoding != FragmentEncoding::SqlWhere {
                return Err(EngineError::internal(format!(
                    "file source received a {:?} fragment",
                    fragment.encoding
                )));
            }
            sql.push_str(&format!(" WHERE {}", fragment.text));
        }
        if let Some(aggregate) = &request.aggregate {
            if !aggregate.group_by.is_empty() {
                let groups = aggregate
                    .group_by
                    .iter()
                    .map(|g| dotted_column(g))
                    .collect::<Vec<_>>()
                    .join(", ");
                sql.push_str(&format!(" GROUP BY {groups}"));
            }
        }
        if !request.order_by.is_empty() {
            let keys = request
                .order_by
                .iter()
                .map(|o| {
                    // Aggregated output is addressed by its output key.
                    let column = if request.aggregate.is_some() {
                        quote_ident(&o.column)
                    } else {
                        dotted_column(&o.column)
                    };
                    format!("{column} {} NULLS LAST", if o.descending { "DESC" } else { "ASC" })
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {keys}"));
        }
        if let Some(limit) = request.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = request.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        Ok(sql)
    }

    fn append_csv(&self, request: &WriteRequest) -> EngineResult<u64> {
        let path = match self.locate(&request.table) {
            Ok((path, FileFormat::Csv)) => path,
            Ok(_) => {
                return Err(EngineError::not_supported(
                    "only CSV files accept inserts",
                ))
            }
            Err(_) => self.root.join(format!("{}.csv", request.table)),
        };
        let write_err = |e: String| {
            EngineError::transport_fatal(KIND, format!("cannot write {}: {e}", path.display()))
        };

        let header: Vec<String> = if path.exists() {
            let mut reader = csv::Reader::from_path(&path).map_err(|e| write_err(e.to_string()))?;
            reader
                .headers()
                .map_err(|e| write_err(e.to_string()))?
                .iter()
                .map(str::to_string)
                .collect()
        } else {
            request
                .rows
                .first()
                .map(|row| row.iter().map(|(c, _)| c.clone()).collect())
                .unwrap_or_default()
        };
        let fresh = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| write_err(e.to_string()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if fresh {
            writer.write_record(&header).map_err(|e| write_err(e.to_string()))?;
        }
        for row in &request.rows {
            for (column, _) in row {
                if !header.contains(column) {
                    return Err(EngineError::query_error(format!(
                        "column '{column}' does not exist in {}",
                        request.table
                    )));
                }
            }
            let record = header.iter().map(|name| {
                row.iter()
                    .find(|(c, _)| c == name)
                    .map(|(_, lit)| csv_field(lit))
                    .unwrap_or_default()
            });
            writer.write_record(record).map_err(|e| write_err(e.to_string()))?;
        }
        writer.flush().map_err(|e| write_err(e.to_string()))?;
        Ok(request.rows.len() as u64)
    }
}

#[async_trait]
impl SourceTransport for FileTransport {
    fn source_kind(&self) -> &'static str {
        KIND
    }

    fn capabilities(&self) -> Capability {
        self.capability.clone()
    }

    #[instrument(skip(self, request), fields(table = %request.table))]
    async fn fetch(&self, request: &FetchRequest, page_token: Option<&str>) -> EngineResult<Page> {
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| EngineError::transport_fatal(KIND, format!("bad page token '{token}'")))?,
            None => 0,
        };
        let page_size = request.page_size.max(1);
        // One extra row tells whether another page exists.
        let select = self.select_sql(request)?;
        let sql = if request.limit.is_none() && request.offset.is_none() {
            format!("{select} LIMIT {} OFFSET {offset}", page_size + 1)
        } else {
            format!("SELECT * FROM ({select}) LIMIT {} OFFSET {offset}", page_size + 1)
        };
        debug!(sql = %sql, "File fetch");

        let (names, mut rows) = tokio::task::spawn_blocking(move || {
            let conn = Connection::open_in_memory()?;
            duck::query(&conn, &sql)
        })
        .await
        .map_err(|e| EngineError::internal(format!("file reader task failed: {e}")))?
        .map_err(|e| EngineError::transport_fatal(KIND, e.to_string()))?;

        let more = rows.len() > page_size;
        rows.truncate(page_size);
        let next_page = more.then(|| (offset + page_size).to_string());
        Ok(Page {
            records: duck::to_records(&names, rows),
            next_page,
        })
    }

    async fn write(&self, request: &WriteRequest) -> EngineResult<u64> {
        match request.operation {
            WriteOperation::Insert => self.append_csv(request),
            WriteOperation::Update | WriteOperation::Delete => Err(EngineError::not_supported(
                "file sources only accept INSERT",
            )),
        }
    }

    async fn list_tables(&self) -> EngineResult<Vec<String>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            EngineError::transport_fatal(KIND, format!("cannot read {}: {e}", self.root.display()))
        })?;
        let mut tables: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .and_then(FileFormat::from_extension)
                    .is_some()
            })
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        tables.sort();
        tables.dedup();
        Ok(tables)
    }
}

/// `address.city` → `"address"."city"`
fn dotted_column(dotted: &str) -> String {
    render_column(&ColumnRef {
        qualifier: None,
        path: dotted.split('.').map(str::to_string).collect(),
    })
}

fn csv_field(literal: &Literal) -> String {
    match literal {
        Literal::Null => String::new(),
        Literal::String(s) => s.clone(),
        Literal::Bool(b) => b.to_string(),
        Literal::Int(i) => i.to_string(),
        Literal::Float(f) => f.to_string(),
        Literal::Timestamp(ts) => ts.to_rfc3339(),
    }
}
