use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use url::Url;

use crate::keys::{self, SeenSet};
use crate::record::Record;

/// A typed attribute in the store's JSON wire format, e.g. `{"S": "abc"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AttributeValue {
    S(String),
    N(String),
    #[serde(rename = "BOOL")]
    Bool(bool),
    #[serde(rename = "NULL")]
    Null(bool),
    M(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    pub fn s(value: impl Into<String>) -> Self {
        AttributeValue::S(value.into())
    }

    pub fn n(value: i64) -> Self {
        AttributeValue::N(value.to_string())
    }
}

/// The coercion every field goes through, whatever record it belongs to:
/// null → NULL, bool → BOOL, number → N, array/object → JSON text in S,
/// string → S.
impl From<&Value> for AttributeValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => AttributeValue::Null(true),
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => AttributeValue::N(n.to_string()),
            Value::Array(_) | Value::Object(_) => AttributeValue::S(value.to_string()),
            Value::String(s) => AttributeValue::S(s.clone()),
        }
    }
}

/// One record as written to the store. Built once, never updated; the store
/// expires it through `expires_at`.
#[derive(Debug, Clone)]
pub struct StoreItem {
    pub partition_key: String,
    pub sort_key: String,
    pub record: Record,
    pub domain: String,
    pub search_terms: Vec<String>,
    pub reverse_sort: String,
    pub expires_at: i64,
}

impl StoreItem {
    /// Derive keys for `record`, claiming its sort key in `seen`.
    pub fn build(record: &Record, seen: &mut SeenSet, now: DateTime<Utc>) -> StoreItem {
        let partition_key = keys::partition_key(now);
        let base = keys::base_sort_key(record.timestamp, &record.dashed_name());
        let sort_key = seen.next_key(&partition_key, &base);

        StoreItem {
            partition_key,
            sort_key,
            domain: domain_of(&record.url),
            search_terms: record.search_terms(),
            reverse_sort: keys::reverse_sort_value(record.timestamp),
            expires_at: keys::ttl(now),
            record: record.clone(),
        }
    }

    pub fn attributes(&self) -> BTreeMap<String, AttributeValue> {
        let timestamp = self.record.timestamp_iso();
        let search_partition = match self.search_terms.first() {
            Some(term) => format!("SEARCH#{}", term),
            None => "SEARCH#unknown".to_string(),
        };
        let product: BTreeMap<String, AttributeValue> = self
            .record
            .fields()
            .iter()
            .map(|(k, v)| (k.clone(), AttributeValue::from(v)))
            .collect();

        BTreeMap::from([
            ("PK".to_string(), AttributeValue::s(&self.partition_key)),
            ("SK".to_string(), AttributeValue::s(&self.sort_key)),
            ("Stage".to_string(), AttributeValue::s("raw")),
            ("CreatedAt".to_string(), AttributeValue::s(&timestamp)),
            ("OriginalTimestamp".to_string(), AttributeValue::s(&timestamp)),
            ("ProductName".to_string(), AttributeValue::s(self.record.dashed_name())),
            ("Domain".to_string(), AttributeValue::s(&self.domain)),
            ("GSI1PK".to_string(), AttributeValue::s("TIMESTAMP")),
            ("GSI1SK".to_string(), AttributeValue::s(&self.reverse_sort)),
            ("GSI2PK".to_string(), AttributeValue::s("TIMERANGE")),
            ("SearchTerms".to_string(), AttributeValue::from(&json!(self.search_terms))),
            ("GSI3PK".to_string(), AttributeValue::s(search_partition)),
            ("GSI3SK".to_string(), AttributeValue::s(&self.reverse_sort)),
            ("ProductData".to_string(), AttributeValue::M(product)),
            ("ExpiryTime".to_string(), AttributeValue::n(self.expires_at)),
        ])
    }

    pub fn put_request(&self) -> Value {
        json!({ "PutRequest": { "Item": self.attributes() } })
    }
}

/// Throwaway item used to prove the table accepts writes. Expires in an hour.
pub fn check_item(now: DateTime<Utc>) -> Value {
    let item = BTreeMap::from([
        ("PK".to_string(), AttributeValue::s("STAGE#TEST")),
        (
            "SK".to_string(),
            AttributeValue::s(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ),
        ("Stage".to_string(), AttributeValue::s("test")),
        ("Domain".to_string(), AttributeValue::s("test.example.com")),
        ("ExpiryTime".to_string(), AttributeValue::n(now.timestamp() + 3600)),
        (
            "ProductData".to_string(),
            AttributeValue::M(BTreeMap::from([(
                "name".to_string(),
                AttributeValue::s("Test Product"),
            )])),
        ),
    ]);
    json!({ "PutRequest": { "Item": item } })
}

/// `{"RequestItems": {<table>: [PutRequest, ...]}}`
pub fn batch_write_body(table: &str, requests: Vec<Value>) -> Value {
    json!({ "RequestItems": { table: requests } })
}

fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
