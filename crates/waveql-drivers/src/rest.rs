// SPDX-License-Identifier: Apache-2.0

//! Generic JSON REST source.
//!
//! Each table is a collection endpoint below `base_url`. Pages are requested
//! with limit/offset query parameters; filters travel the way the declared
//! capability says (a single query parameter, a raw query string or a JSON
//! body).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value as Json;
use tracing::{debug, instrument, warn};
use url::Url;

use waveql_core::capability::{Capability, DialectKind, FragmentEncoding, PredicateShape};
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::CompareOp;
use waveql_core::traits::{FetchRequest, Page, SourceTransport, WriteOperation, WriteRequest};
use waveql_core::Sensitive;

const KIND: &str = "rest";

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: Url,
    pub token: Option<Sensitive<String>>,
    pub capability: Capability,
    /// JSON pointer to the record array in a response body; the body itself
    /// when `None`.
    pub records_pointer: Option<String>,
    pub limit_param: String,
    pub offset_param: String,
    /// Parameter carrying `column` / `-column` sort keys, when supported.
    pub sort_param: Option<String>,
    pub timeout: Duration,
}

impl RestConfig {
    /// Equality and IN filters as `k=v` pairs, 30 s timeout.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            token: None,
            capability: Capability::none(DialectKind::QueryString, FragmentEncoding::QueryString)
                .with_shapes([PredicateShape::Compare(CompareOp::Eq), PredicateShape::In])
                .with_max_in_list(100),
            records_pointer: None,
            limit_param: "limit".into(),
            offset_param: "offset".into(),
            sort_param: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<Sensitive<String>>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn with_records_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.records_pointer = Some(pointer.into());
        self
    }
}

pub struct RestTransport {
    config: RestConfig,
    client: Client,
}

impl RestTransport {
    pub fn new(config: RestConfig) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn table_url(&self, table: &str) -> EngineResult<Url> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| EngineError::internal(format!("'{}' cannot be a base URL", self.config.base_url)))?
            .pop_if_empty()
            .push(table);
        Ok(url)
    }

    /// URL of the page starting `consumed` records into the result, and the
    /// number of records to ask for. `None` once a pushed LIMIT is exhausted.
    fn page_url(&self, request: &FetchRequest, consumed: u64) -> EngineResult<Option<(Url, u64)>> {
        let mut page_size = request.page_size.max(1) as u64;
        if let Some(limit) = request.limit {
            if consumed >= limit {
                return Ok(None);
            }
            page_size = page_size.min(limit - consumed);
        }
        let offset = request.offset.unwrap_or(0) + consumed;

        let mut url = self.table_url(&request.table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair(&self.config.limit_param, &page_size.to_string());
            pairs.append_pair(&self.config.offset_param, &offset.to_string());
            if let Some(sort_param) = &self.config.sort_param {
                if !request.order_by.is_empty() {
                    let keys = request
                        .order_by
                        .iter()
                        .map(|o| if o.descending { format!("-{}", o.column) } else { o.column.clone() })
                        .collect::<Vec<_>>()
                        .join(",");
                    pairs.append_pair(sort_param, &keys);
                }
            }
            if let Some(fragment) = &request.fragment {
                if let FragmentEncoding::QueryParam { name } = &fragment.encoding {
                    pairs.append_pair(name, &fragment.text);
                }
            }
        }
        if let Some(fragment) = &request.fragment {
            if fragment.encoding == FragmentEncoding::QueryString {
                // Already percent-encoded by the dialect.
                let query = match url.query() {
                    Some(existing) => format!("{existing}&{}", fragment.text),
                    None => fragment.text.clone(),
                };
                url.set_query(Some(&query));
            }
        }
        Ok(Some((url, page_size)))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token.expose()),
            None => builder,
        }
    }

    fn extract_records(&self, body: Json) -> EngineResult<Vec<Json>> {
        let target = match &self.config.records_pointer {
            Some(pointer) => body.pointer(pointer).cloned().ok_or_else(|| {
                EngineError::transport_fatal(KIND, format!("response has no '{pointer}'"))
            })?,
            None => body,
        };
        match target {
            Json::Array(records) => Ok(records),
            Json::Null => Ok(Vec::new()),
            object @ Json::Object(_) => Ok(vec![object]),
            other => Err(EngineError::transport_fatal(
                KIND,
                format!("expected a record array, got {other}"),
            )),
        }
    }
}

/// 429 and 5xx are worth retrying; other failures are not.
fn status_error(status: StatusCode, body: &str) -> EngineError {
    let message = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EngineError::transport(KIND, message)
    } else {
        EngineError::transport_fatal(KIND, message)
    }
}

fn request_error(error: reqwest::Error) -> EngineError {
    if error.is_timeout() || error.is_connect() {
        EngineError::transport(KIND, error.to_string())
    } else {
        EngineError::transport_fatal(KIND, error.to_string())
    }
}

#[async_trait]
impl SourceTransport for RestTransport {
    fn source_kind(&self) -> &'static str {
        KIND
    }

    fn capabilities(&self) -> Capability {
        self.config.capability.clone()
    }

    #[instrument(skip(self, request), fields(table = %request.table))]
    async fn fetch(&self, request: &FetchRequest, page_token: Option<&str>) -> EngineResult<Page> {
        if request.aggregate.is_some() || !request.joins.is_empty() {
            return Err(EngineError::internal(
                "aggregates and joins cannot be pushed to a REST source",
            ));
        }
        let consumed = match page_token {
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| EngineError::transport_fatal(KIND, format!("bad page token '{token}'")))?,
            None => 0,
        };
        let Some((url, requested)) = self.page_url(request, consumed)? else {
            return Ok(Page::default());
        };

        let builder = match &request.fragment {
            Some(fragment) if fragment.encoding == FragmentEncoding::JsonBody => {
                let body: Json = serde_json::from_str(&fragment.text)
                    .map_err(|e| EngineError::internal(format!("invalid JSON filter: {e}")))?;
                self.client.post(url.clone()).json(&body)
            }
            _ => self.client.get(url.clone()),
        };
        debug!(url = %url, "REST fetch");

        let response = self.authorize(builder).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "REST source rejected request");
            return Err(status_error(status, &body));
        }
        let body: Json = response.json().await.map_err(request_error)?;
        let records = self.extract_records(body)?;

        let fetched = records.len() as u64;
        let next_page = (fetched == requested).then(|| (consumed + fetched).to_string());
        Ok(Page { records, next_page })
    }

    async fn write(&self, request: &WriteRequest) -> EngineResult<u64> {
        if request.operation != WriteOperation::Insert {
            return Err(EngineError::not_supported(
                "REST sources only accept INSERT",
            ));
        }
        let url = self.table_url(&request.table)?;
        for row in &request.rows {
            let record: serde_json::Map<String, Json> = row
                .iter()
                .map(|(column, literal)| (column.clone(), literal.to_json()))
                .collect();
            let response = self
                .authorize(self.client.post(url.clone()).json(&record))
                .send()
                .await
                .map_err(request_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }
        }
        Ok(request.rows.len() as u64)
    }
}
