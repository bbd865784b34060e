use serde_json::{Map, Value};
use tracing::debug;

/// Result of reconciling one provider payload.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Normalized {
    pub items: Vec<Value>,
    /// Query carried by a search-results wrapper, if the payload had one.
    pub search_term: Option<String>,
}

impl Normalized {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<Value>> for Normalized {
    fn from(items: Vec<Value>) -> Self {
        Normalized { items, search_term: None }
    }
}

/// Flatten any known payload shape into a list of raw product values.
///
/// Shapes, in order: bare array, `{items: [..]}`, `{products: [..]}` (with an
/// optional `searchTerm`), an object keyed by integers, and finally any
/// object-valued properties that look like products. Everything else is empty.
pub fn normalize(raw: Value) -> Normalized {
    match raw {
        Value::Array(items) => {
            debug!("Payload is already an array ({} items)", items.len());
            items.into()
        }
        Value::Object(obj) => normalize_object(obj),
        other => {
            debug!("Unrecognized payload type: {}", type_name(&other));
            Normalized::default()
        }
    }
}

fn normalize_object(mut obj: Map<String, Value>) -> Normalized {
    debug!("Payload object keys: {:?}", obj.keys().collect::<Vec<_>>());

    match obj.remove("items") {
        Some(Value::Array(items)) => {
            debug!("Found products in items property");
            return items.into();
        }
        Some(other) => {
            obj.insert("items".to_string(), other);
        }
        None => {}
    }

    let search_term = obj
        .get("searchTerm")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match obj.remove("products") {
        Some(Value::Array(items)) => {
            match &search_term {
                Some(term) => debug!("Found search results for {:?} ({} products)", term, items.len()),
                None => debug!("Found products in products property"),
            }
            return Normalized { items, search_term };
        }
        Some(Value::Object(inner)) if search_term.is_some() && is_index_map(&inner) => {
            debug!("Found index-keyed search results for {:?}", search_term);
            return Normalized { items: index_map_values(inner), search_term };
        }
        Some(other) => {
            obj.insert("products".to_string(), other);
        }
        None => {}
    }

    if is_index_map(&obj) {
        debug!("Converted object with numeric keys to array");
        return index_map_values(obj).into();
    }

    let items: Vec<Value> = obj.into_values().filter(looks_like_product).collect();
    debug!("Collected {} product-like properties", items.len());
    items.into()
}

fn is_index_map(obj: &Map<String, Value>) -> bool {
    !obj.is_empty() && obj.keys().all(|k| k.parse::<u64>().is_ok())
}

/// Values in ascending index order ("2" before "10").
fn index_map_values(obj: Map<String, Value>) -> Vec<Value> {
    let mut pairs: Vec<(u64, Value)> = obj
        .into_iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v)))
        .collect();
    pairs.sort_by_key(|(k, _)| *k);
    pairs.into_iter().map(|(_, v)| v).collect()
}

fn looks_like_product(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    ["name", "title", "productName"].iter().any(|k| match obj.get(*k) {
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | Some(Value::Bool(false)) | None => false,
        Some(_) => true,
    })
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
