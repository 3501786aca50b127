//! PostgREST adapter (Supabase-style `results` table over HTTP).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{BatchRange, RecordFilter, RecordPatch, RecordStore, ResultRecord};
use crate::error::TallyError;
use crate::util::truncate_chars;

const DEFAULT_TABLE: &str = "results";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Matches the usual PostgREST `max-rows` so a page is never silently cut.
const DEFAULT_PAGE_SIZE: usize = 1000;
const SELECT_COLUMNS: &str = "id,provider,prompt,uses,created_at";

#[derive(Debug, Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    table: String,
    page_size: usize,
}

impl RestStore {
    /// `base_url` is the PostgREST root, e.g. `https://<project>.supabase.co/rest/v1`.
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self, TallyError> {
        Self::with_config(base_url, api_key, DEFAULT_TIMEOUT)
    }

    /// Reads `TALLY_REST_URL`, `TALLY_REST_KEY`, and optionally
    /// `TALLY_REST_TABLE` and `TALLY_REST_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, TallyError> {
        let base_url = std::env::var("TALLY_REST_URL")
            .map_err(|_| TallyError::Validation("TALLY_REST_URL not set".into()))?;
        let api_key = std::env::var("TALLY_REST_KEY")
            .map_err(|_| TallyError::Validation("TALLY_REST_KEY not set".into()))?;
        let timeout = std::env::var("TALLY_REST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let store = Self::with_config(base_url, &api_key, timeout)?;
        Ok(match std::env::var("TALLY_REST_TABLE") {
            Ok(t) if !t.is_empty() => store.with_table(t),
            _ => store,
        })
    }

    pub fn with_config(
        base_url: impl Into<String>,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, TallyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let key = HeaderValue::from_str(api_key)
            .map_err(|_| TallyError::Validation("invalid store API key".into()))?;
        headers.insert("apikey", key);
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| TallyError::Validation("invalid store API key".into()))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            table: DEFAULT_TABLE.into(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.base_url, self.table)
    }

    /// One ranged GET. With `want_count` the server is asked for the exact
    /// match count via `Content-Range`.
    async fn fetch_page(
        &self,
        filter: &RecordFilter,
        offset: usize,
        limit: usize,
        want_count: bool,
    ) -> Result<(Vec<ResultRecord>, Option<usize>), TallyError> {
        let mut query: Vec<(&str, String)> = vec![("select", SELECT_COLUMNS.into())];
        for (col, v) in filter.pairs() {
            query.push((col, format!("eq.{v}")));
        }
        query.push(("order", "created_at.asc,id.asc".into()));
        query.push(("offset", offset.to_string()));
        query.push(("limit", limit.to_string()));

        let mut req = self.client.get(self.table_url()).query(&query);
        if want_count {
            req = req.header("Prefer", "count=exact");
        }
        let resp = check(req.send().await?).await?;
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let rows: Vec<Value> = resp.json().await?;
        let records = rows.iter().map(record_from_json).collect::<Result<Vec<_>, _>>()?;
        Ok((records, total))
    }
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TallyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .ok()
        .and_then(|e| e.message)
        .unwrap_or(body);
    Err(TallyError::Remote {
        status: status.as_u16(),
        message: truncate_chars(&message, 300),
    })
}

/// `0-24/3573` → 3573. `*/0` → 0. Unknown totals (`0-24/*`) → None.
fn parse_content_range_total(v: &str) -> Option<usize> {
    v.rsplit_once('/')?.1.trim().parse().ok()
}

fn invalid(msg: impl Into<String>) -> TallyError {
    TallyError::InvalidRecord(msg.into())
}

fn record_from_json(row: &Value) -> Result<ResultRecord, TallyError> {
    let obj = row.as_object().ok_or_else(|| invalid("row is not an object"))?;
    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(invalid("row without id")),
    };
    let text = |col: &str| match obj.get(col) {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(invalid(format!("{col} missing or not text on {id}"))),
    };
    let uses = match obj.get("uses") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let raw_ts = text("created_at")?;
    let created_at = parse_timestamp(&raw_ts)
        .ok_or_else(|| invalid(format!("bad created_at {raw_ts:?} on {id}")))?;
    Ok(ResultRecord {
        provider: text("provider")?,
        prompt: text("prompt")?,
        id,
        uses,
        created_at,
    })
}

/// timestamptz renders with an offset; plain timestamp columns don't and are
/// taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|n| n.and_utc())
        })
}

#[async_trait]
impl RecordStore for RestStore {
    fn kind(&self) -> &'static str {
        "rest"
    }

    async fn select(
        &self,
        filter: &RecordFilter,
        range: Option<BatchRange>,
    ) -> Result<Vec<ResultRecord>, TallyError> {
        if let Some(r) = range {
            let (mut rows, _) = self.fetch_page(filter, r.offset, r.limit, false).await?;
            if rows.len() > r.limit {
                warn!(got = rows.len(), limit = r.limit, "store ignored limit, truncating");
                rows.truncate(r.limit);
            }
            return Ok(rows);
        }

        // Unranged: page until the reported total (or an empty page) so a
        // server-side row cap never truncates a duplicate group.
        let (mut out, total) = self.fetch_page(filter, 0, self.page_size, true).await?;
        let mut last = out.len();
        while last > 0 && total.map_or(true, |t| out.len() < t) {
            let (page, _) = self.fetch_page(filter, out.len(), self.page_size, false).await?;
            last = page.len();
            out.extend(page);
        }
        debug!(rows = out.len(), pages_total = ?total, "unranged select");
        Ok(out)
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), TallyError> {
        let resp = self
            .client
            .delete(self.table_url())
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn update_by_id(&self, id: &str, patch: &RecordPatch) -> Result<(), TallyError> {
        if patch.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .patch(self.table_url())
            .query(&[("id", format!("eq.{id}")), ("select", "id".to_string())])
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        let touched: Vec<Value> = check(resp).await?.json().await?;
        if touched.is_empty() {
            return Err(TallyError::NotFound);
        }
        Ok(())
    }
}
