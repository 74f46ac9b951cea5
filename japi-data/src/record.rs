use serde_json::Value;

/// A storage row: a dynamic JSON object keyed by column name.
///
/// Backends may keep ids numeric internally; the engine stringifies them at
/// the JSON:API boundary via [`id_string`].
pub type Record = serde_json::Map<String, Value>;

/// Render an id value as its canonical decimal-string form.
///
/// Numbers become their decimal rendering, strings pass through, everything
/// else (null, objects, arrays, booleans) is not an id.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract a record's id under the given id column, stringified.
pub fn record_id(record: &Record, id_field: &str) -> Option<String> {
    record.get(id_field).and_then(id_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_stringify_decimal() {
        assert_eq!(id_string(&json!(42)), Some("42".to_string()));
        assert_eq!(id_string(&json!("42")), Some("42".to_string()));
        assert_eq!(id_string(&json!(null)), None);
        assert_eq!(id_string(&json!(true)), None);
    }

    #[test]
    fn record_id_reads_configured_column() {
        let mut rec = Record::new();
        rec.insert("uid".into(), json!(7));
        assert_eq!(record_id(&rec, "uid"), Some("7".to_string()));
        assert_eq!(record_id(&rec, "id"), None);
    }
}
