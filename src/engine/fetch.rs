//! Single-table fetch: one short-lived SQLite connection per call, alias
//! translation on the way in and out, id/date filtering, and per-column type
//! widening (Int64 -> Float64 -> String) into a polars frame.

use polars::prelude::*;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tracing::debug;

use crate::catalog::{quote_ident, ProjectContext};
use crate::df_utils;
use crate::error::{AppError, AppResult};

/// Column builder that widens as values arrive, mirroring how mixed-type
/// SQLite columns behave in practice.
enum ColBuf {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
}

impl ColBuf {
    fn new() -> Self {
        ColBuf::Int(Vec::new())
    }

    fn widen_to_float(&mut self) {
        if let ColBuf::Int(vals) = self {
            let vals = std::mem::take(vals);
            *self = ColBuf::Float(vals.into_iter().map(|o| o.map(|v| v as f64)).collect());
        }
    }

    fn widen_to_str(&mut self) {
        match self {
            ColBuf::Int(vals) => {
                let vals = std::mem::take(vals);
                *self = ColBuf::Str(vals.into_iter().map(|o| o.map(|v| v.to_string())).collect());
            }
            ColBuf::Float(vals) => {
                let vals = std::mem::take(vals);
                *self = ColBuf::Str(vals.into_iter().map(|o| o.map(|v| v.to_string())).collect());
            }
            ColBuf::Str(_) => {}
        }
    }

    fn push(&mut self, value: ValueRef<'_>) {
        match value {
            ValueRef::Null => match self {
                ColBuf::Int(v) => v.push(None),
                ColBuf::Float(v) => v.push(None),
                ColBuf::Str(v) => v.push(None),
            },
            ValueRef::Integer(i) => match self {
                ColBuf::Int(v) => v.push(Some(i)),
                ColBuf::Float(v) => v.push(Some(i as f64)),
                ColBuf::Str(v) => v.push(Some(i.to_string())),
            },
            ValueRef::Real(f) => {
                self.widen_to_float();
                match self {
                    ColBuf::Float(v) => v.push(Some(f)),
                    ColBuf::Str(v) => v.push(Some(f.to_string())),
                    ColBuf::Int(_) => unreachable!(),
                }
            }
            ValueRef::Text(t) => {
                self.widen_to_str();
                match self {
                    ColBuf::Str(v) => v.push(Some(String::from_utf8_lossy(t).into_owned())),
                    _ => unreachable!(),
                }
            }
            ValueRef::Blob(b) => {
                self.widen_to_str();
                match self {
                    ColBuf::Str(v) => v.push(Some(String::from_utf8_lossy(b).into_owned())),
                    _ => unreachable!(),
                }
            }
        }
    }

    fn into_series(self, name: &str) -> Series {
        match self {
            ColBuf::Int(v) => Series::new(name.into(), v),
            ColBuf::Float(v) => Series::new(name.into(), v),
            ColBuf::Str(v) => Series::new(name.into(), v),
        }
    }
}

/// List the real column names of a table in declaration order.
pub fn table_columns(conn: &Connection, real_table: &str) -> AppResult<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(real_table));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut cols = Vec::new();
    while let Some(row) = rows.next()? {
        cols.push(row.get::<_, String>(1)?);
    }
    Ok(cols)
}

/// The identifier column convention: the first requested column whose name
/// contains the substring "ID", defaulting to the literal "ID". When several
/// columns match, the first in request order wins.
pub fn id_filter_column(columns: &[String]) -> String {
    columns
        .iter()
        .find(|c| c.contains("ID"))
        .cloned()
        .unwrap_or_else(|| "ID".to_string())
}

/// Fetch one table as a frame. `columns` of `None` selects every column.
/// `selected_ids` filters the identifier column when non-empty; the date
/// range applies only when both bounds and a period column are present.
/// Column names are translated back to alias form on the way out, except the
/// identifier column, which keeps its original name.
#[allow(clippy::too_many_arguments)]
pub fn fetch_table(
    ctx: &ProjectContext,
    db: &str,
    table_alias: &str,
    selected_ids: &[String],
    columns: Option<&[String]>,
    start_date: Option<&str>,
    end_date: Option<&str>,
    period_column: Option<&str>,
) -> AppResult<DataFrame> {
    let path = ctx.db_path(db)?;
    let conn = Connection::open(&path)
        .map_err(|e| AppError::io("db_open".to_string(), format!("cannot open database '{}': {}", db, e)))?;

    let real_table = ctx.alias.resolve_table(table_alias);

    let (select_cols, id_request) = match columns {
        Some(cols) => {
            let real: Vec<String> =
                cols.iter().map(|c| ctx.alias.resolve_column(table_alias, c)).collect();
            (real, id_filter_column(cols))
        }
        None => (table_columns(&conn, &real_table)?, "ID".to_string()),
    };
    if select_cols.is_empty() {
        return Err(AppError::schema("empty_table".to_string(), format!("table '{}' has no columns", table_alias)));
    }

    let select_list: Vec<String> = select_cols.iter().map(|c| quote_ident(c)).collect();
    let mut sql = format!("SELECT {} FROM {}", select_list.join(","), quote_ident(&real_table));
    let mut params: Vec<String> = Vec::new();
    let mut clauses: Vec<String> = Vec::new();

    if !selected_ids.is_empty() {
        let id_real = ctx.alias.resolve_column(table_alias, &id_request);
        let placeholders = vec!["?"; selected_ids.len()].join(",");
        clauses.push(format!("{} IN ({})", quote_ident(&id_real), placeholders));
        params.extend(selected_ids.iter().cloned());
    }
    if let (Some(start), Some(end), Some(period)) = (start_date, end_date, period_column) {
        let period_real = ctx.alias.resolve_column(table_alias, period);
        clauses.push(format!("{} BETWEEN ? AND ?", quote_ident(&period_real)));
        params.push(start.to_string());
        params.push(end.to_string());
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    debug!(target: "hydrolens::fetch", "fetch '{}'.'{}': {}", db, table_alias, sql);

    let fetched = read_query(&conn, &sql, &params)?;

    // Real -> alias on the way out; the identifier column keeps its name.
    let mut df = fetched;
    let names: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    for name in &names {
        if name.contains(&id_request) {
            continue;
        }
        let out_name = ctx.alias.resolve_column(&real_table, name);
        if &out_name != name {
            df.rename(name, out_name.into())?;
        }
    }
    Ok(df_utils::round_dataframe(df)?)
}

/// Run a query and collect its result set column-major with type widening.
pub(crate) fn read_query(conn: &Connection, sql: &str, params: &[String]) -> AppResult<DataFrame> {
    let mut stmt = conn.prepare(sql)?;
    let col_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut bufs: Vec<ColBuf> = col_names.iter().map(|_| ColBuf::new()).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    while let Some(row) = rows.next()? {
        for (i, buf) in bufs.iter_mut().enumerate() {
            buf.push(row.get_ref(i)?);
        }
    }

    let cols: Vec<Column> = col_names
        .iter()
        .zip(bufs)
        .map(|(name, buf)| buf.into_series(name).into())
        .collect();
    Ok(DataFrame::new(cols)?)
}
