//! Merge heterogeneous records into one uniform table.
//!
//! The upstream has no fixed schema: every record exposes its own field
//! subset, nested to arbitrary depth. Assembly flattens nested objects to
//! dotted path keys, serializes arrays into a single cell, and computes the
//! column union in first-seen order so identical input sequences always
//! produce identical column order.

use brapi_protocol::{Record, ResultSet, unix_now};
use serde_json::Value;

/// Flattened columns plus column-complete rows. No row is ever dropped for
/// missing fields; absent values become explicit nulls.
pub fn assemble(records: Vec<Record>) -> (Vec<String>, Vec<Record>) {
    let flattened: Vec<Record> = records.into_iter().map(flatten_record).collect();

    let mut columns: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for record in &flattened {
        for key in record.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }

    let rows = flattened
        .into_iter()
        .map(|record| complete_row(record, &columns))
        .collect();

    (columns, rows)
}

/// Assemble a fetch outcome into the immutable cached shape. `truncated`
/// is recomputed from the counts so the stored invariant always holds.
pub fn assemble_result_set(
    session_id: impl Into<String>,
    result_id: impl Into<String>,
    records: Vec<Record>,
    total_matches: u64,
) -> ResultSet {
    let (columns, rows) = assemble(records);
    let returned_count = rows.len() as u64;
    let total_matches = total_matches.max(returned_count);
    ResultSet {
        session_id: session_id.into(),
        result_id: result_id.into(),
        columns,
        truncated: total_matches > returned_count,
        total_matches,
        returned_count,
        rows,
        created_at: unix_now(),
    }
}

fn flatten_record(record: Record) -> Record {
    let mut out = Record::new();
    for (key, value) in record {
        flatten_value(&key, value, &mut out);
    }
    out
}

fn flatten_value(path: &str, value: Value, out: &mut Record) {
    match value {
        Value::Object(map) => {
            if map.is_empty() {
                out.insert(path.to_string(), Value::Null);
                return;
            }
            for (key, nested) in map {
                flatten_value(&format!("{path}.{key}"), nested, out);
            }
        }
        // Arrays stay one cell: expanding them would multiply rows and the
        // table shape must match the record count.
        Value::Array(items) => {
            let serialized = serde_json::to_string(&Value::Array(items))
                .unwrap_or_else(|_| "[]".to_string());
            out.insert(path.to_string(), Value::String(serialized));
        }
        scalar => {
            out.insert(path.to_string(), scalar);
        }
    }
}

fn complete_row(record: Record, columns: &[String]) -> Record {
    let mut row = Record::with_capacity(columns.len());
    for column in columns {
        let value = record.get(column).cloned().unwrap_or(Value::Null);
        row.insert(column.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn column_union_is_first_seen_order() {
        let records = vec![
            record(&[("b", json!(1)), ("a", json!(2))]),
            record(&[("c", json!(3)), ("a", json!(4))]),
        ];
        let (columns, rows) = assemble(records);
        assert_eq!(columns, vec!["b", "a", "c"]);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn column_order_is_reproducible() {
        let make = || {
            vec![
                record(&[("x", json!(1))]),
                record(&[("y", json!(2)), ("x", json!(3))]),
                record(&[("z", json!(4))]),
            ]
        };
        let (first, _) = assemble(make());
        let (second, _) = assemble(make());
        assert_eq!(first, second);
    }

    #[test]
    fn missing_fields_become_explicit_nulls() {
        let records = vec![
            record(&[("a", json!(1)), ("b", json!(2))]),
            record(&[("a", json!(3))]),
        ];
        let (columns, rows) = assemble(records);
        assert_eq!(columns, vec!["a", "b"]);
        assert_eq!(rows[1].get("b"), Some(&Value::Null));
        // Every row presents every column.
        for row in &rows {
            assert_eq!(row.len(), columns.len());
        }
    }

    #[test]
    fn nested_objects_flatten_to_dotted_paths() {
        let records = vec![record(&[(
            "location",
            json!({"coordinates": {"lat": -19.8, "lon": 34.8}, "name": "Chokwe"}),
        )])];
        let (columns, rows) = assemble(records);
        assert_eq!(
            columns,
            vec![
                "location.coordinates.lat",
                "location.coordinates.lon",
                "location.name"
            ]
        );
        assert_eq!(rows[0].get("location.name"), Some(&json!("Chokwe")));
    }

    #[test]
    fn arrays_stay_single_serialized_cells() {
        let records = vec![record(&[("synonyms", json!(["beauregard", "covington"]))])];
        let (columns, rows) = assemble(records);
        assert_eq!(columns, vec!["synonyms"]);
        assert_eq!(
            rows[0].get("synonyms"),
            Some(&json!("[\"beauregard\",\"covington\"]"))
        );
    }

    #[test]
    fn empty_objects_flatten_to_null() {
        let records = vec![record(&[("extra", json!({}))])];
        let (columns, rows) = assemble(records);
        assert_eq!(columns, vec!["extra"]);
        assert_eq!(rows[0].get("extra"), Some(&Value::Null));
    }

    #[test]
    fn result_set_invariants_hold() {
        let records = vec![record(&[("a", json!(1))]), record(&[("a", json!(2))])];
        let set = assemble_result_set("sess", "res", records, 10);
        assert_eq!(set.returned_count, 2);
        assert_eq!(set.rows.len(), 2);
        assert_eq!(set.total_matches, 10);
        assert!(set.truncated);

        let complete = assemble_result_set("sess", "res2", Vec::new(), 0);
        assert_eq!(complete.returned_count, 0);
        assert!(!complete.truncated);
    }
}
