//! URL query-string decoding into [`QueryParams`], plus the canonical
//! serializer that makes the parse/serialize round-trip testable.

use std::collections::BTreeMap;

use serde_json::Value;

use japi_data::SortKey;

/// Normalized query parameters, as decoded from a request's query string.
///
/// Decoding never fails; malformed values surface at validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    /// Dot-paths from `include=a,b.c`.
    pub include: Vec<String>,
    /// Sparse fieldsets, kept comma-joined as received; the validator splits.
    pub fields: BTreeMap<String, String>,
    /// `filter[name]=value`; repeated keys coalesce to the last occurrence.
    pub filters: BTreeMap<String, Value>,
    /// Ordered sort keys from `sort=-created_at,title`.
    pub sort: Vec<SortKey>,
    /// `page[key]=value`; integral values are stored numerically.
    pub page: BTreeMap<String, Value>,
}

impl QueryParams {
    /// Decode a URL-style query string. Unknown keys are ignored.
    pub fn parse(query: &str) -> Self {
        let mut params = QueryParams::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "include" => {
                    params
                        .include
                        .extend(value.split(',').filter(|s| !s.is_empty()).map(String::from));
                }
                "sort" => {
                    params.sort = value
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(SortKey::parse)
                        .collect();
                }
                other => {
                    if let Some(name) = bracket_key(other, "filter") {
                        params
                            .filters
                            .insert(name.to_string(), Value::String(value.into_owned()));
                    } else if let Some(name) = bracket_key(other, "fields") {
                        params.fields.insert(name.to_string(), value.into_owned());
                    } else if let Some(name) = bracket_key(other, "page") {
                        let value = match value.parse::<i64>() {
                            Ok(n) => Value::from(n),
                            Err(_) => Value::String(value.into_owned()),
                        };
                        params.page.insert(name.to_string(), value);
                    }
                }
            }
        }
        params
    }

    /// Render the canonical query-string form: stable member order, stable
    /// key order inside each member.
    pub fn to_query_string(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        if !self.include.is_empty() {
            serializer.append_pair("include", &self.include.join(","));
        }
        for (kind, value) in &self.fields {
            serializer.append_pair(&format!("fields[{kind}]"), value);
        }
        for (name, value) in &self.filters {
            serializer.append_pair(&format!("filter[{name}]"), &scalar_text(value));
        }
        if !self.sort.is_empty() {
            let rendered: Vec<String> = self
                .sort
                .iter()
                .map(|key| match key.direction {
                    japi_data::SortDirection::Asc => key.field.clone(),
                    japi_data::SortDirection::Desc => format!("-{}", key.field),
                })
                .collect();
            serializer.append_pair("sort", &rendered.join(","));
        }
        for (name, value) in &self.page {
            serializer.append_pair(&format!("page[{name}]"), &scalar_text(value));
        }
        serializer.finish()
    }

    /// Numeric page value under `key`, when present and integral.
    pub fn page_number(&self, key: &str) -> Option<u64> {
        match self.page.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

fn bracket_key<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
        .filter(|name| !name.is_empty())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
