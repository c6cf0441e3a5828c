// SPDX-License-Identifier: Apache-2.0

//! Forward-only result sets.
//!
//! A [`ResultSet`] is the receiving end of a running query: rows arrive from
//! the coordinator as they are produced and are consumed once. Dropping the
//! result set cancels the query.

use std::io;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde_json::{Map, Value as Json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use waveql_core::error::{EngineError, EngineResult};
use waveql_core::types::{Row, Schema, Table};

use crate::federation::types::{ExecutionSummary, StreamEvent};

pub struct ResultSet {
    receiver: Option<mpsc::Receiver<StreamEvent>>,
    cancel: CancellationToken,
    description: Arc<Schema>,
    summary: Option<ExecutionSummary>,
    affected: Option<u64>,
    delivered: u64,
    finished: bool,
}

impl ResultSet {
    /// Waits for the column description of a running query. Errors raised
    /// before the first row (planning defects, failed fetches) surface here.
    pub(crate) async fn open(
        mut receiver: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> EngineResult<Self> {
        loop {
            match receiver.recv().await {
                Some(StreamEvent::Columns(description)) => {
                    return Ok(Self {
                        receiver: Some(receiver),
                        cancel,
                        description,
                        summary: None,
                        affected: None,
                        delivered: 0,
                        finished: false,
                    });
                }
                Some(StreamEvent::Error(error)) => return Err(error),
                Some(StreamEvent::Row(_)) | Some(StreamEvent::Done(_)) => {
                    return Err(EngineError::internal("query stream started without columns"));
                }
                None => return Err(closed(&cancel)),
            }
        }
    }

    /// Result of a write: no columns, only an affected-row count.
    pub(crate) fn from_write(affected: u64) -> Self {
        Self {
            receiver: None,
            cancel: CancellationToken::new(),
            description: Arc::new(Schema::new(Vec::new())),
            summary: None,
            affected: Some(affected),
            delivered: 0,
            finished: true,
        }
    }

    pub fn description(&self) -> &Arc<Schema> {
        &self.description
    }

    pub fn column_names(&self) -> Vec<String> {
        self.description.column_names()
    }

    pub async fn next_row(&mut self) -> EngineResult<Option<Row>> {
        if self.finished {
            return Ok(None);
        }
        let Some(receiver) = self.receiver.as_mut() else {
            self.finished = true;
            return Ok(None);
        };
        loop {
            match receiver.recv().await {
                Some(StreamEvent::Row(row)) => {
                    self.delivered += 1;
                    return Ok(Some(row));
                }
                // A widened source schema re-describes the remaining rows.
                Some(StreamEvent::Columns(description)) => self.description = description,
                Some(StreamEvent::Done(summary)) => {
                    self.summary = Some(*summary);
                    self.finished = true;
                    return Ok(None);
                }
                Some(StreamEvent::Error(error)) => {
                    self.finished = true;
                    return Err(error);
                }
                None => {
                    self.finished = true;
                    return Err(closed(&self.cancel));
                }
            }
        }
    }

    /// Up to `n` rows; fewer only at the end of the result.
    pub async fn fetch_many(&mut self, n: usize) -> EngineResult<Vec<Row>> {
        let mut rows = Vec::with_capacity(n.min(1024));
        while rows.len() < n {
            match self.next_row().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub async fn fetch_all(&mut self) -> EngineResult<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Remaining rows together with the column description.
    pub async fn into_table(mut self) -> EngineResult<Table> {
        let rows = self.fetch_all().await?;
        Ok(Table::new(self.description.clone(), rows))
    }

    pub fn into_stream(self) -> impl Stream<Item = EngineResult<Row>> {
        stream::unfold(self, |mut results| async move {
            match results.next_row().await {
                Ok(Some(row)) => Some((Ok(row), results)),
                Ok(None) => None,
                Err(error) => Some((Err(error), results)),
            }
        })
    }

    /// Remaining rows as JSON objects keyed by column name.
    pub async fn to_json_rows(&mut self) -> EngineResult<Vec<Json>> {
        let names = self.column_names();
        let rows = self.fetch_all().await?;
        Ok(rows
            .iter()
            .map(|row| {
                let object: Map<String, Json> = names
                    .iter()
                    .cloned()
                    .zip(row.values.iter().map(|v| v.to_json()))
                    .collect();
                Json::Object(object)
            })
            .collect())
    }

    /// Streams the remaining rows to `writer` as CSV with a header line.
    /// Nulls are empty fields; nested values are written as JSON.
    /// Returns the number of data rows written.
    pub async fn write_csv<W: io::Write>(&mut self, writer: W) -> EngineResult<u64> {
        let mut csv = csv::Writer::from_writer(writer);
        csv.write_record(self.column_names()).map_err(csv_error)?;
        let mut written = 0u64;
        while let Some(row) = self.next_row().await? {
            csv.write_record(row.values.iter().map(|v| v.to_string()))
                .map_err(csv_error)?;
            written += 1;
        }
        csv.flush()
            .map_err(|e| EngineError::internal(format!("CSV export failed: {e}")))?;
        Ok(written)
    }

    /// Affected rows for writes; rows delivered for a fully consumed query.
    pub fn rowcount(&self) -> Option<u64> {
        match self.affected {
            Some(affected) => Some(affected),
            None if self.finished => Some(self.delivered),
            None => None,
        }
    }

    /// Fetch statistics and warnings, available once the last row was read.
    pub fn summary(&self) -> Option<&ExecutionSummary> {
        self.summary.as_ref()
    }

    pub fn warnings(&self) -> &[String] {
        self.summary.as_ref().map(|s| s.warnings.as_slice()).unwrap_or(&[])
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stops the query. Rows already buffered may still be read; the stream
    /// then ends with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn closed(cancel: &CancellationToken) -> EngineError {
    if cancel.is_cancelled() {
        EngineError::Cancelled
    } else {
        EngineError::internal("query stream closed unexpectedly")
    }
}

fn csv_error(error: csv::Error) -> EngineError {
    EngineError::internal(format!("CSV export failed: {error}"))
}
