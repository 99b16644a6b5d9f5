//! Table and column metadata: table listings, per-table column/time-range
//! discovery, and the multi-table variant that feeds the schema cache and
//! validates that the requested tables are mutually compatible.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::catalog::schema_cache::table_key;
use crate::catalog::{quote_ident, ProjectContext};
use crate::error::{AppError, AppResult};
use crate::request::DbTable;

use super::{fetch, temporal};

/// Period-column detection order: the first of these present in a table
/// decides the table's date type and native interval.
const DATE_COLUMNS: [(&str, &str, &str); 4] = [
    ("Time", "Time", "daily"),
    ("Date", "Time", "daily"),
    ("Month", "Month", "monthly"),
    ("Year", "Year", "yearly"),
];

#[derive(Debug, Clone, Serialize)]
pub struct ColumnsTimeRange {
    pub columns: Vec<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub id_column: String,
    pub ids: Vec<String>,
    pub date_type: Option<String>,
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiColumnsTimeRange {
    pub columns: Vec<String>,
    pub start_date: String,
    pub end_date: String,
    pub id_column: String,
    pub ids: Vec<String>,
    pub date_type: String,
    pub interval: String,
}

/// All table names of a database, translated to alias form.
pub fn table_names(ctx: &ProjectContext, db: &str) -> AppResult<Vec<String>> {
    let path = ctx.db_path(db)?;
    let conn = Connection::open(&path)?;
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
    let mut rows = stmt.query([])?;
    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        let real: String = row.get(0)?;
        names.push(ctx.alias.table_alias(&real));
    }
    Ok(names)
}

fn distinct_ids(conn: &Connection, real_table: &str, id_column: &str) -> AppResult<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT {} FROM {}",
        quote_ident(id_column),
        quote_ident(real_table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let value = match row.get_ref(0)? {
            rusqlite::types::ValueRef::Integer(i) => i.to_string(),
            rusqlite::types::ValueRef::Real(f) => f.to_string(),
            rusqlite::types::ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
            _ => continue,
        };
        ids.push(value);
    }
    Ok(ids)
}

/// Column names (alias form), period column detection with its value range,
/// the identifier column, and the distinct identifier list of one table.
pub fn columns_and_time_range(ctx: &ProjectContext, db: &str, table: &str) -> AppResult<ColumnsTimeRange> {
    let real_table = ctx.alias.resolve_table(table);
    let path = ctx.db_path(db)?;
    let conn = Connection::open(&path)?;

    let real_cols = fetch::table_columns(&conn, &real_table)?;
    if real_cols.is_empty() {
        return Err(AppError::schema(
            "unknown_table".to_string(),
            format!("table '{}' does not exist in '{}'", table, db),
        ));
    }
    let alias_cols: Vec<String> =
        real_cols.iter().map(|c| ctx.alias.resolve_column(&real_table, c)).collect();

    let mut start_date = None;
    let mut end_date = None;
    let mut date_type = None;
    let mut interval = None;
    for (date_col, dtype, inter) in DATE_COLUMNS {
        if !real_cols.iter().any(|c| c == date_col) {
            continue;
        }
        if dtype == "Time" {
            // Text dates: parse and take the true min/max.
            let sql = format!("SELECT {} FROM {}", quote_ident(date_col), quote_ident(&real_table));
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut min = None;
            let mut max = None;
            while let Some(row) = rows.next()? {
                let raw: Option<String> = row.get(0).ok();
                let Some(raw) = raw else { continue };
                let Ok(d) = temporal::parse_period(&raw) else { continue };
                min = Some(min.map_or(d, |m: chrono::NaiveDate| m.min(d)));
                max = Some(max.map_or(d, |m: chrono::NaiveDate| m.max(d)));
            }
            start_date = min.map(|d| d.format("%Y-%m-%d").to_string());
            end_date = max.map(|d| d.format("%Y-%m-%d").to_string());
        } else {
            let sql = format!(
                "SELECT MIN({c}), MAX({c}) FROM {t}",
                c = quote_ident(date_col),
                t = quote_ident(&real_table)
            );
            let (lo, hi): (Option<i64>, Option<i64>) =
                conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
            start_date = lo.map(|v| v.to_string());
            end_date = hi.map(|v| v.to_string());
        }
        date_type = Some(dtype.to_string());
        interval = Some(inter.to_string());
        break;
    }

    let id_column = real_cols.iter().find(|c| c.contains("ID")).cloned();
    let ids = match &id_column {
        Some(idc) => distinct_ids(&conn, &real_table, idc)?,
        None => Vec::new(),
    };

    Ok(ColumnsTimeRange {
        columns: alias_cols,
        start_date,
        end_date,
        id_column: id_column.unwrap_or_default(),
        ids,
        date_type,
        interval,
    })
}

/// Sort identifiers numerically when they all parse as integers, otherwise
/// lexicographically.
fn sorted_ids(ids: HashSet<String>) -> Vec<String> {
    let mut ids: Vec<String> = ids.into_iter().collect();
    if ids.iter().all(|s| s.parse::<i64>().is_ok()) {
        ids.sort_by_key(|s| s.parse::<i64>().unwrap());
    } else {
        ids.sort();
    }
    ids
}

/// Metadata across every table of a request. Populates the schema cache
/// (evicting entries the request no longer names), rejects incompatible
/// table combinations, and intersects the date ranges and identifier sets.
pub fn multi_columns_and_time_range(
    ctx: &ProjectContext,
    db_tables: &[DbTable],
) -> AppResult<MultiColumnsTimeRange> {
    if db_tables.is_empty() {
        return Err(AppError::validation("empty_request", "no tables requested"));
    }

    let mut per: Vec<(ColumnsTimeRange, Vec<String>)> = Vec::with_capacity(db_tables.len());
    let mut all_columns: HashSet<String> = HashSet::new();

    for spec in db_tables {
        let ctr = columns_and_time_range(ctx, &spec.db, &spec.table)?;

        // Duplicate column names get the table prefix so the combined list
        // stays unambiguous; the period and identifier columns are exempt.
        let prefixed: Vec<String> = ctr
            .columns
            .iter()
            .map(|c| {
                let is_date = ctr.date_type.as_deref() == Some(c.as_str());
                if all_columns.contains(c) && !is_date && !c.to_lowercase().contains("id") {
                    format!("{}-{}", spec.table, c)
                } else {
                    c.clone()
                }
            })
            .collect();
        all_columns.extend(ctr.columns.iter().cloned());

        let mut cached = ctr.columns.clone();
        if !ctr.ids.is_empty() {
            cached.push(ctr.id_column.clone());
        }
        ctx.schema_cache.insert(table_key(&spec.db, &spec.table), cached);

        per.push((ctr, prefixed));
    }

    let requested: HashSet<String> =
        db_tables.iter().map(|t| table_key(&t.db, &t.table)).collect();
    ctx.schema_cache.retain_requested(&requested);
    debug!(target: "hydrolens::metadata", "schema cache now holds {} tables", ctx.schema_cache.len());

    for (label, values) in [
        ("date type", per.iter().map(|(c, _)| c.date_type.clone()).collect::<HashSet<_>>()),
        ("interval", per.iter().map(|(c, _)| c.interval.clone()).collect::<HashSet<_>>()),
        ("id column", per.iter().map(|(c, _)| Some(c.id_column.clone())).collect::<HashSet<_>>()),
    ] {
        if values.len() > 1 {
            return Err(AppError::validation(
                "incompatible_tables".to_string(),
                format!("Tables have different {}", label),
            ));
        }
    }

    let start_date = per.iter().filter_map(|(c, _)| c.start_date.clone()).max().unwrap_or_default();
    let end_date = per.iter().filter_map(|(c, _)| c.end_date.clone()).min().unwrap_or_default();
    let date_type = per[0].0.date_type.clone().unwrap_or_default();
    let interval = per[0].0.interval.clone().unwrap_or_default();
    let id_column = per[0].0.id_column.clone();
    let include_id = per.iter().any(|(c, _)| !c.ids.is_empty());

    let id_name = if id_column.is_empty() { "ID".to_string() } else { id_column.clone() };
    let mut columns: Vec<String> = Vec::new();
    if !date_type.is_empty() {
        columns.push(date_type.clone());
    }
    if include_id {
        columns.push(id_name.clone());
    }
    for (_, prefixed) in &per {
        for c in prefixed {
            if c != &date_type && !c.contains(&id_name) && !columns.contains(c) {
                columns.push(c.clone());
            }
        }
    }

    let mut ids: HashSet<String> = per[0].0.ids.iter().cloned().collect();
    for (c, _) in per.iter().skip(1) {
        let other: HashSet<String> = c.ids.iter().cloned().collect();
        ids = ids.intersection(&other).cloned().collect();
    }

    Ok(MultiColumnsTimeRange {
        columns,
        start_date,
        end_date,
        id_column: id_name,
        ids: sorted_ids(ids),
        date_type,
        interval,
    })
}
