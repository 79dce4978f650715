//! Structured data store access
//!
//! Reads and writes rows through `{base}/rest/v1/{table}`. Rows that do not
//! match the expected shape are skipped with a warning instead of failing
//! the whole read.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::query::{parse_content_range_total, Query};
use crate::{check_status, BackendClient, BackendError, BackendResult, CallTimer};

const REST_PREFIX: &str = "rest/v1/";

impl BackendClient {
    /// Fetch all rows matching `query`
    pub async fn select<T: DeserializeOwned>(&self, query: &Query) -> BackendResult<Vec<T>> {
        let (rows, _) = self.select_with_count(query).await?;
        Ok(rows)
    }

    /// Fetch rows plus the exact total when the query asked for one
    pub async fn select_with_count<T: DeserializeOwned>(
        &self,
        query: &Query,
    ) -> BackendResult<(Vec<T>, Option<u64>)> {
        let timer = CallTimer::start("select", query.table_name());
        let result = self.do_select(query).await;
        timer.finish(result)
    }

    async fn do_select<T: DeserializeOwned>(
        &self,
        query: &Query,
    ) -> BackendResult<(Vec<T>, Option<u64>)> {
        let url = self.endpoint(&format!("{}{}", REST_PREFIX, query.table_name()))?;
        let mut request = self.authorize(self.http.get(url)).query(&query.read_params());
        if query.wants_count() {
            request = request.header("Prefer", "count=exact");
        }

        let response = check_status(request.send().await?).await?;
        let total = content_range_total(&response);
        let body: Value = response.json().await?;

        Ok((decode_rows(query.table_name(), body)?, total))
    }

    /// First matching row, if any
    pub async fn maybe_single<T: DeserializeOwned>(&self, query: &Query) -> BackendResult<Option<T>> {
        let rows = self.select(&query.clone().limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// Exact number of rows matching `query`
    pub async fn count(&self, query: &Query) -> BackendResult<u64> {
        let timer = CallTimer::start("count", query.table_name());
        let result = self.do_count(query).await;
        timer.finish(result)
    }

    async fn do_count(&self, query: &Query) -> BackendResult<u64> {
        let url = self.endpoint(&format!("{}{}", REST_PREFIX, query.table_name()))?;
        let response = self
            .authorize(self.http.head(url))
            .query(&query.filter_params())
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check_status(response).await?;

        content_range_total(&response).ok_or_else(|| {
            BackendError::InvalidResponse("missing Content-Range total".to_string())
        })
    }

    /// Insert one row and return what the backend stored
    pub async fn insert<B, T>(&self, table: &str, row: &B) -> BackendResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let timer = CallTimer::start("insert", table);
        let result = self.do_insert(table, row).await;
        timer.finish(result)
    }

    async fn do_insert<B, T>(&self, table: &str, row: &B) -> BackendResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(&format!("{}{}", REST_PREFIX, table))?;
        let response = self
            .authorize(self.http.post(url))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        first_row(table, body)
    }

    /// Patch every row matching `query`. Unfiltered updates are refused.
    pub async fn update<B, T>(&self, query: &Query, patch: &B) -> BackendResult<Vec<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let timer = CallTimer::start("update", query.table_name());
        let result = self.do_update(query, patch).await;
        timer.finish(result)
    }

    async fn do_update<B, T>(&self, query: &Query, patch: &B) -> BackendResult<Vec<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        if !query.has_filters() {
            return Err(BackendError::Config(format!(
                "refusing unfiltered update on {}",
                query.table_name()
            )));
        }

        let url = self.endpoint(&format!("{}{}", REST_PREFIX, query.table_name()))?;
        let response = self
            .authorize(self.http.patch(url))
            .query(&query.filter_params())
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        decode_rows(query.table_name(), body)
    }

    /// Delete every row matching `query`. Unfiltered deletes are refused.
    pub async fn delete(&self, query: &Query) -> BackendResult<()> {
        let timer = CallTimer::start("delete", query.table_name());
        let result = self.do_delete(query).await;
        timer.finish(result)
    }

    async fn do_delete(&self, query: &Query) -> BackendResult<()> {
        if !query.has_filters() {
            return Err(BackendError::Config(format!(
                "refusing unfiltered delete on {}",
                query.table_name()
            )));
        }

        let url = self.endpoint(&format!("{}{}", REST_PREFIX, query.table_name()))?;
        let response = self
            .authorize(self.http.delete(url))
            .query(&query.filter_params())
            .send()
            .await?;
        check_status(response).await?;

        debug!("Deleted rows from {}", query.table_name());
        Ok(())
    }
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("content-range")
        .and_then(|h| h.to_str().ok())
        .and_then(parse_content_range_total)
}

/// Decode an array body, skipping rows of the wrong shape
pub(crate) fn decode_rows<T: DeserializeOwned>(table: &str, body: Value) -> BackendResult<Vec<T>> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(BackendError::InvalidResponse(format!(
                "expected array from {}, got {}",
                table,
                type_name(&other)
            )))
        }
    };

    let total = rows.len();
    let decoded: Vec<T> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value(row) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!("Skipping malformed {} row: {}", table, e);
                None
            }
        })
        .collect();

    if decoded.len() < total {
        debug!("{} of {} {} rows decoded", decoded.len(), total, table);
    }

    Ok(decoded)
}

fn first_row<T: DeserializeOwned>(table: &str, body: Value) -> BackendResult<T> {
    let row = match body {
        Value::Array(rows) => rows.into_iter().next(),
        obj @ Value::Object(_) => Some(obj),
        _ => None,
    }
    .ok_or_else(|| BackendError::InvalidResponse(format!("empty write result from {}", table)))?;

    serde_json::from_value(row).map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
