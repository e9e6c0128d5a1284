//! Flat CSV projection of a cached result, written at publish time so the
//! export location is servable as-is.

use brapi_protocol::Record;
use serde_json::Value;

pub fn render_csv(columns: &[String], rows: &[Record]) -> String {
    let mut out = String::new();
    out.push_str(&render_row_of(columns.iter().map(String::as_str)));
    out.push_str("\r\n");
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| cell_text(row.get(column)))
            .collect();
        out.push_str(&render_row_of(cells.iter().map(String::as_str)));
        out.push_str("\r\n");
    }
    out
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Bool(flag)) => flag.to_string(),
        Some(Value::Number(number)) => number.to_string(),
        // Assembly flattens objects and serializes arrays; anything else
        // left over is rendered as compact JSON.
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn render_row_of<'a>(cells: impl Iterator<Item = &'a str>) -> String {
    cells.map(quote_cell).collect::<Vec<_>>().join(",")
}

fn quote_cell(cell: &str) -> String {
    if cell.contains(',') || cell.contains('"') || cell.contains('\n') || cell.contains('\r') {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
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
    fn renders_header_and_rows() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            record(&[("id", json!("g1")), ("name", json!("acc-1"))]),
            record(&[("id", json!("g2")), ("name", Value::Null)]),
        ];
        let csv = render_csv(&columns, &rows);
        assert_eq!(csv, "id,name\r\ng1,acc-1\r\ng2,\r\n");
    }

    #[test]
    fn quotes_embedded_commas_and_quotes() {
        let columns = vec!["note".to_string()];
        let rows = vec![record(&[("note", json!("said \"hi\", twice"))])];
        let csv = render_csv(&columns, &rows);
        assert_eq!(csv, "note\r\n\"said \"\"hi\"\", twice\"\r\n");
    }

    #[test]
    fn numbers_and_booleans_render_bare() {
        let columns = vec!["count".to_string(), "active".to_string()];
        let rows = vec![record(&[("count", json!(42)), ("active", json!(true))])];
        let csv = render_csv(&columns, &rows);
        assert_eq!(csv, "count,active\r\n42,true\r\n");
    }
}
