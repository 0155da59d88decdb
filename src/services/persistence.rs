use async_trait::async_trait;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use url::Url;

use crate::core::error::PersistenceError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Hosted table API base, e.g. `https://<project>.supabase.co`.
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
    /// CORS proxy that answers GET with `{ "data": [...] }`. Used for listing when set.
    pub proxy_url: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            table: default_table(),
            proxy_url: None,
        }
    }
}

fn default_table() -> String {
    "story".to_string()
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct NewStoryRecord {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Text")]
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "Title", default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(rename = "Description", default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(rename = "Text")]
    pub text: String,
}

/// Nullable table columns come back as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[async_trait]
pub trait StoryStore: Send + Sync + fmt::Debug {
    async fn append(&self, record: NewStoryRecord) -> Result<StoredRecord, PersistenceError>;
    async fn list_all(&self) -> Result<Vec<StoredRecord>, PersistenceError>;
}

pub fn sort_newest_first(records: &mut [StoredRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Returns `None` when neither the table API nor a proxy is configured.
pub fn create_store(config: &PersistenceConfig) -> Result<Option<Box<dyn StoryStore>>> {
    let table = match (&config.supabase_url, &config.anon_key) {
        (Some(url), Some(key)) if !url.is_empty() && !key.is_empty() => {
            Some(TableApi::new(url, key, &config.table)?)
        }
        _ => None,
    };
    let proxy = match &config.proxy_url {
        Some(url) if !url.is_empty() => {
            Some(Url::parse(url).with_context(|| format!("Invalid proxy URL: {}", url))?)
        }
        _ => None,
    };

    if table.is_none() && proxy.is_none() {
        return Ok(None);
    }
    info!(
        "Story store: table API {}, proxy listing {}",
        if table.is_some() { "on" } else { "off" },
        if proxy.is_some() { "on" } else { "off" }
    );
    Ok(Some(Box::new(RestStoryStore {
        table,
        proxy,
        client: reqwest::Client::new(),
    })))
}

#[derive(Debug, Clone)]
struct TableApi {
    endpoint: Url,
    anon_key: String,
}

impl TableApi {
    fn new(base_url: &str, anon_key: &str, table: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .with_context(|| format!("Invalid table API URL: {}", base_url))?;
        let endpoint = base
            .join(&format!("rest/v1/{}", table))
            .with_context(|| format!("Invalid table name: {}", table))?;
        Ok(Self {
            endpoint,
            anon_key: anon_key.to_string(),
        })
    }
}

/// Direct table API for inserts; listing goes through the proxy when one is configured.
#[derive(Debug)]
struct RestStoryStore {
    table: Option<TableApi>,
    proxy: Option<Url>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ProxyEnvelope {
    data: Option<Vec<StoredRecord>>,
}

async fn read_body(resp: reqwest::Response) -> Result<String, PersistenceError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or(body);
        return Err(PersistenceError::Upstream {
            status: status.as_u16(),
            message,
        });
    }
    Ok(body)
}

fn parse_rows(body: &str) -> Result<Vec<StoredRecord>, PersistenceError> {
    serde_json::from_str(body).map_err(|e| PersistenceError::InvalidResponse(e.to_string()))
}

fn parse_proxy(body: &str) -> Result<Vec<StoredRecord>, PersistenceError> {
    let envelope: ProxyEnvelope = serde_json::from_str(body)
        .map_err(|e| PersistenceError::InvalidResponse(e.to_string()))?;
    envelope
        .data
        .ok_or_else(|| PersistenceError::InvalidResponse("missing data property".to_string()))
}

#[async_trait]
impl StoryStore for RestStoryStore {
    async fn append(&self, record: NewStoryRecord) -> Result<StoredRecord, PersistenceError> {
        let table = self
            .table
            .as_ref()
            .ok_or(PersistenceError::NotConfigured("table API URL and anon key are required to save"))?;

        debug!("Inserting story \"{}\" ({} chars)", record.title, record.text.len());
        let resp = self.client.post(table.endpoint.clone())
            .header("apikey", &table.anon_key)
            .bearer_auth(&table.anon_key)
            .header("Prefer", "return=representation")
            .json(&[record])
            .send()
            .await?;

        let body = read_body(resp).await?;
        parse_rows(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| PersistenceError::InvalidResponse("insert returned no rows".to_string()))
    }

    async fn list_all(&self) -> Result<Vec<StoredRecord>, PersistenceError> {
        if let Some(proxy) = &self.proxy {
            debug!("Listing stories via proxy {}", proxy);
            let resp = self.client.get(proxy.clone())
                .header("Accept", "application/json")
                .send()
                .await?;
            let body = read_body(resp).await?;
            return parse_proxy(&body);
        }

        let table = self
            .table
            .as_ref()
            .ok_or(PersistenceError::NotConfigured("no proxy or table API to list from"))?;
        let mut url = table.endpoint.clone();
        url.query_pairs_mut().append_pair("select", "*");

        debug!("Listing stories from {}", table.endpoint);
        let resp = self.client.get(url)
            .header("apikey", &table.anon_key)
            .bearer_auth(&table.anon_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let body = read_body(resp).await?;
        parse_rows(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: &str = r#"[
        {"id": 1, "created_at": "2024-05-01T08:00:00.123456+00:00", "Title": "Old", "Description": "d", "Text": "t"},
        {"id": 2, "created_at": "2024-06-01T08:00:00+00:00", "Title": "New", "Description": "d", "Text": "t"}
    ]"#;

    #[test]
    fn test_record_wire_names() {
        let record = NewStoryRecord {
            title: "T1".to_string(),
            description: "D1".to_string(),
            text: "Part 1".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["Title"], "T1");
        assert_eq!(value["Description"], "D1");
        assert_eq!(value["Text"], "Part 1");
    }

    #[test]
    fn test_rows_parse_and_sort_newest_first() {
        let mut rows = parse_rows(ROWS).unwrap();
        sort_newest_first(&mut rows);
        assert_eq!(rows[0].title, "New");
        assert_eq!(rows[1].title, "Old");
        assert_eq!(rows[0].id, RecordId::Int(2));
    }

    #[test]
    fn test_proxy_envelope() {
        let body = format!(r#"{{"data": {}}}"#, ROWS);
        assert_eq!(parse_proxy(&body).unwrap().len(), 2);
        assert_eq!(parse_proxy(r#"{"data": []}"#).unwrap().len(), 0);

        let err = parse_proxy(r#"{"rows": []}"#).unwrap_err();
        assert_eq!(err.to_string(), "invalid response: missing data property");
    }

    #[test]
    fn test_null_columns_do_not_hide_other_rows() {
        let body = r#"{"data": [
            {"id": 1, "created_at": "2024-05-01T08:00:00Z", "Title": "Kept", "Description": null, "Text": "t"},
            {"id": 2, "created_at": "2024-06-01T08:00:00Z", "Title": null, "Description": "d", "Text": "t"}
        ]}"#;
        let rows = parse_proxy(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].title, "Kept");
        assert_eq!(rows[0].description, "");
        assert_eq!(rows[1].title, "");
        assert_eq!(rows[1].description, "d");
    }

    #[test]
    fn test_uuid_ids_are_accepted() {
        let rows = parse_rows(
            r#"[{"id": "7d3c", "created_at": "2024-06-01T08:00:00Z", "Title": "T", "Text": "x"}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].id.to_string(), "7d3c");
        assert_eq!(rows[0].description, "");
    }

    #[test]
    fn test_table_endpoint() {
        let api = TableApi::new("https://abc.supabase.co/", "anon", "story").unwrap();
        assert_eq!(api.endpoint.as_str(), "https://abc.supabase.co/rest/v1/story");
    }

    #[test]
    fn test_create_store_requires_some_backend() {
        assert!(create_store(&PersistenceConfig::default()).unwrap().is_none());

        let config = PersistenceConfig {
            proxy_url: Some("https://abc.supabase.co/functions/v1/proxy-request".to_string()),
            ..PersistenceConfig::default()
        };
        assert!(create_store(&config).unwrap().is_some());

        let config = PersistenceConfig {
            proxy_url: Some("not a url".to_string()),
            ..PersistenceConfig::default()
        };
        assert!(create_store(&config).is_err());
    }

    #[tokio::test]
    async fn test_proxy_only_store_cannot_save() {
        let config = PersistenceConfig {
            proxy_url: Some("https://abc.supabase.co/functions/v1/proxy-request".to_string()),
            ..PersistenceConfig::default()
        };
        let store = create_store(&config).unwrap().unwrap();
        let err = store
            .append(NewStoryRecord {
                title: "t".to_string(),
                description: "d".to_string(),
                text: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::NotConfigured(_)));
    }
}
