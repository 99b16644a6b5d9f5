use polars::prelude::*;
use serde_json::{Map, Value};

/// Shared numeric rounding rule applied wherever numeric output is
/// finalized: values with magnitude below 0.01 keep 4 decimal places,
/// everything else keeps 2.
pub fn round_value(v: f64) -> f64 {
    if !v.is_finite() {
        return v;
    }
    let scale = if v.abs() < 0.01 { 1e4 } else { 1e2 };
    (v * scale).round() / scale
}

/// Apply the rounding rule to every Float64 column of the frame.
pub fn round_dataframe(mut df: DataFrame) -> PolarsResult<DataFrame> {
    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    for name in names {
        if df.column(&name)?.dtype() != &DataType::Float64 {
            continue;
        }
        let ca = df.column(&name)?.f64()?;
        let rounded: Vec<Option<f64>> = ca.into_iter().map(|opt| opt.map(round_value)).collect();
        df.replace(&name, Series::new(name.as_str().into(), rounded))?;
    }
    Ok(df)
}

pub fn anyvalue_to_json(av: AnyValue) -> Value {
    match av {
        AnyValue::Int64(v) => serde_json::json!(v),
        AnyValue::Int32(v) => serde_json::json!(v as i64),
        AnyValue::UInt32(v) => serde_json::json!(v as i64),
        AnyValue::UInt64(v) => serde_json::json!(v),
        AnyValue::Float64(v) => serde_json::json!(v),
        AnyValue::Float32(v) => serde_json::json!(v as f64),
        AnyValue::Boolean(v) => serde_json::json!(v),
        AnyValue::String(v) => serde_json::json!(v),
        AnyValue::StringOwned(v) => serde_json::json!(v.as_str()),
        AnyValue::Null => Value::Null,
        _ => Value::Null,
    }
}

/// Convert a frame into one JSON object per row, plus the column order
/// (JSON objects do not preserve it).
pub fn dataframe_rows(df: &DataFrame) -> (Vec<Map<String, Value>>, Vec<String>) {
    let cols: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let mut out = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut map = Map::with_capacity(cols.len());
        for c in &cols {
            let v = match df.column(c) {
                Ok(col) => col.get(row_idx).map(anyvalue_to_json).unwrap_or(Value::Null),
                Err(_) => Value::Null,
            };
            map.insert(c.clone(), v);
        }
        out.push(map);
    }
    (out, cols)
}

/// Read a single cell as display text. Used for period labels in the
/// statistics table.
pub fn cell_string(df: &DataFrame, column: &str, row: usize) -> Option<String> {
    let av = df.column(column).ok()?.get(row).ok()?;
    match av {
        AnyValue::String(s) => Some(s.to_string()),
        AnyValue::StringOwned(s) => Some(s.to_string()),
        AnyValue::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_rule_by_magnitude() {
        assert_eq!(round_value(1.23456), 1.23);
        assert_eq!(round_value(-1.23556), -1.24);
        assert_eq!(round_value(0.0012345), 0.0012);
        assert_eq!(round_value(-0.0098765), -0.0099);
        assert_eq!(round_value(0.0), 0.0);
    }

    #[test]
    fn rounding_is_idempotent() {
        for v in [1.23456, 0.0098765, -0.00123449, 123.456, 0.00995] {
            let once = round_value(v);
            assert_eq!(round_value(once), once, "value {v}");
        }
    }

    #[test]
    fn round_dataframe_touches_floats_only() {
        let df = DataFrame::new(vec![
            Series::new("id".into(), vec![1i64, 2]).into(),
            Series::new("v".into(), vec![1.23456f64, 0.00123449]).into(),
        ])
        .unwrap();
        let df = round_dataframe(df).unwrap();
        let v = df.column("v").unwrap().f64().unwrap();
        assert_eq!(v.get(0), Some(1.23));
        assert_eq!(v.get(1), Some(0.0012));
        assert_eq!(df.column("id").unwrap().i64().unwrap().get(1), Some(2));
    }

    #[test]
    fn rows_carry_column_order() {
        let df = DataFrame::new(vec![
            Series::new("ID".into(), vec![7i64]).into(),
            Series::new("Flow".into(), vec![1.5f64]).into(),
        ])
        .unwrap();
        let (rows, cols) = dataframe_rows(&df);
        assert_eq!(cols, vec!["ID".to_string(), "Flow".to_string()]);
        assert_eq!(rows[0]["ID"], serde_json::json!(7));
        assert_eq!(rows[0]["Flow"], serde_json::json!(1.5));
    }
}
