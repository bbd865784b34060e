use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Map, Value};

pub const UNKNOWN_PRODUCT: &str = "Unknown Product";
pub const UNKNOWN_BRAND: &str = "Unknown Brand";
const UNKNOWN_SIZE: &str = "N/A";

static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Raw keys consumed into named fields; anything else is carried in `extra`.
const KNOWN_KEYS: &[&str] = &[
    "name",
    "title",
    "productName",
    "brand",
    "url",
    "price",
    "imageUrl",
    "image",
    "size",
    "rawTextContent",
    "description",
    "timestamp",
    "search",
    "searchTerm",
];

/// One scraped product, with placeholders instead of missing values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub brand: String,
    pub url: String,
    pub price: String,
    pub image_url: String,
    pub size: String,
    pub raw_text: String,
    pub timestamp: DateTime<Utc>,
    pub search_term: Option<String>,
    pub extra: Map<String, Value>,
}

impl Record {
    /// Shape one normalized raw item. Non-object items are not products.
    pub fn from_raw(raw: &Value, page_url: &str, captured_at: DateTime<Utc>) -> Option<Record> {
        let obj = raw.as_object()?;

        let timestamp = text_field(obj, &["timestamp"])
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(captured_at);

        let extra = obj
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Record {
            name: text_field(obj, &["name", "title", "productName"])
                .unwrap_or_else(|| UNKNOWN_PRODUCT.to_string()),
            brand: text_field(obj, &["brand"]).unwrap_or_else(|| UNKNOWN_BRAND.to_string()),
            url: text_field(obj, &["url"]).unwrap_or_else(|| page_url.to_string()),
            price: text_field(obj, &["price"]).unwrap_or_default(),
            image_url: text_field(obj, &["imageUrl", "image"]).unwrap_or_default(),
            size: text_field(obj, &["size"]).unwrap_or_else(|| UNKNOWN_SIZE.to_string()),
            raw_text: text_field(obj, &["rawTextContent", "description"]).unwrap_or_default(),
            timestamp,
            search_term: text_field(obj, &["search", "searchTerm"]),
            extra,
        })
    }

    /// A record with only a name; everything else defaulted.
    #[cfg(test)]
    pub fn named(name: &str, captured_at: DateTime<Utc>) -> Record {
        Record {
            name: name.to_string(),
            brand: UNKNOWN_BRAND.to_string(),
            url: String::new(),
            price: String::new(),
            image_url: String::new(),
            size: UNKNOWN_SIZE.to_string(),
            raw_text: String::new(),
            timestamp: captured_at,
            search_term: None,
            extra: Map::new(),
        }
    }

    /// Name with whitespace runs collapsed to `-`, as used in sort keys.
    pub fn dashed_name(&self) -> String {
        WHITESPACE_RE.replace_all(self.name.trim(), "-").into_owned()
    }

    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Lowercase index tokens: the search term if there is one, otherwise
    /// name, brand, raw text and size. Tokens of two chars or fewer are dropped.
    pub fn search_terms(&self) -> Vec<String> {
        let text = match &self.search_term {
            Some(term) => term.to_lowercase(),
            None => {
                let joined = [&self.name, &self.brand, &self.raw_text, &self.size]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
                    .to_lowercase();
                NON_WORD_RE.replace_all(&joined, " ").into_owned()
            }
        };

        let mut seen = HashSet::new();
        text.split_whitespace()
            .filter(|w| w.chars().count() > 2)
            .filter(|w| seen.insert(w.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Field name/value pairs as they appear in the stored product document.
    pub fn fields(&self) -> Vec<(String, Value)> {
        let search = self
            .search_term
            .clone()
            .unwrap_or_else(|| self.search_terms().join(" "));

        let mut fields = vec![
            ("name".to_string(), Value::from(self.name.clone())),
            ("brand".to_string(), Value::from(self.brand.clone())),
            ("url".to_string(), Value::from(self.url.clone())),
            ("price".to_string(), Value::from(self.price.clone())),
            ("imageUrl".to_string(), Value::from(self.image_url.clone())),
            ("size".to_string(), Value::from(self.size.clone())),
            ("rawTextContent".to_string(), Value::from(self.raw_text.clone())),
            ("timestamp".to_string(), Value::from(self.timestamp_iso())),
            ("search".to_string(), Value::from(search)),
        ];
        fields.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        fields
    }
}

/// First non-empty value among `keys`, numbers rendered as text.
fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
