//! Multi-table merge: folds the per-table fetches into one wide frame.
//!
//! Requested columns are checked against the schema cache (populated by the
//! metadata operation), table-prefixed names are stripped and re-applied to
//! disambiguate duplicates, and each new table is inner-joined onto the
//! accumulator over every identifier column plus any shared non-prefixed
//! column (which lets a common period column act as an implicit join key).
//! The first failing table aborts the whole request with an error naming it.

use polars::prelude::*;
use tracing::debug;

use crate::catalog::schema_cache::table_key;
use crate::catalog::ProjectContext;
use crate::error::{AppError, AppResult};
use crate::request::{ColumnSelection, DbTable};

use super::fetch;

/// Drop every row containing a null. Inner-join output is only meaningful
/// when all requested tables contributed a value.
pub fn drop_null_rows(df: DataFrame) -> PolarsResult<DataFrame> {
    let mut mask: Option<BooleanChunked> = None;
    for name in df.get_column_names() {
        let col_mask = df.column(name.as_str())?.is_not_null();
        mask = Some(match mask {
            None => col_mask,
            Some(m) => m & col_mask,
        });
    }
    match mask {
        Some(m) => df.filter(&m),
        None => Ok(df),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn merge_tables(
    ctx: &ProjectContext,
    db_tables: &[DbTable],
    columns: &ColumnSelection,
    selected_ids: &[String],
    id_column: &str,
    start_date: Option<&str>,
    end_date: Option<&str>,
    period_column: Option<&str>,
) -> AppResult<DataFrame> {
    let mut acc: Option<DataFrame> = None;
    // Named-column requests consume their columns as tables satisfy them;
    // the period and identifier columns stay fetchable for every table.
    let mut remaining: Option<Vec<String>> = match columns {
        ColumnSelection::All => None,
        ColumnSelection::Named(cols) => Some(cols.clone()),
    };

    for spec in db_tables {
        let key = table_key(&spec.db, &spec.table);
        let Some(known) = ctx.schema_cache.get(&key) else {
            return Err(AppError::schema(
                "unknown_table".to_string(),
                format!("No columns found for the table {}", key),
            ));
        };
        let table_has_id = known.iter().any(|c| c == id_column);

        let (fetch_cols, duplicate_cols, is_all) = match remaining.as_mut() {
            None => (None, Vec::new(), true),
            Some(rem) => {
                let prefix = format!("{}-", spec.table);
                let mut fetch_cols: Vec<String> = Vec::new();
                let mut dups: Vec<String> = Vec::new();
                for col in rem.iter() {
                    if let Some(orig) = col.strip_prefix(&prefix) {
                        if known.iter().any(|c| c == orig) && !fetch_cols.iter().any(|c| c == orig) {
                            fetch_cols.push(orig.to_string());
                            dups.push(col.clone());
                        }
                    } else if known.iter().any(|c| c == col) && !fetch_cols.contains(col) {
                        fetch_cols.push(col.clone());
                    }
                }
                rem.retain(|c| !fetch_cols.contains(c));
                if let Some(period) = period_column {
                    if !rem.iter().any(|c| c == period) {
                        rem.push(period.to_string());
                    }
                }
                if table_has_id && !rem.iter().any(|c| c == id_column) {
                    rem.push(id_column.to_string());
                }
                if fetch_cols.is_empty() {
                    // No requested column lives in this table; skip it.
                    continue;
                }
                (Some(fetch_cols), dups, false)
            }
        };

        let wrap = |e: AppError| {
            AppError::data(
                "table_error".to_string(),
                format!("Error while processing table {}: {}", key, e.message()),
            )
        };

        let mut df_temp = fetch::fetch_table(
            ctx,
            &spec.db,
            &spec.table,
            selected_ids,
            fetch_cols.as_deref(),
            start_date,
            end_date,
            period_column,
        )
        .map_err(wrap)?;

        // Re-apply the table prefix to columns that were requested in
        // disambiguated form.
        for dup in &duplicate_cols {
            let orig = &dup[spec.table.len() + 1..];
            if df_temp.get_column_names().iter().any(|c| c.as_str() == orig) {
                df_temp.rename(orig, dup.as_str().into()).map_err(|e| wrap(e.into()))?;
            }
        }

        acc = Some(match acc.take() {
            None => df_temp,
            Some(df) => {
                let acc_cols: Vec<String> =
                    df.get_column_names().iter().map(|s| s.to_string()).collect();

                // With an all-columns fetch, the incoming table may repeat
                // accumulator column names. Rename collisions to
                // "{table}-{column}" so they stay distinguishable; join key
                // columns (identifier and period) are exempt, they must keep
                // their names for the join below.
                if is_all {
                    for col in &acc_cols {
                        let collides =
                            df_temp.get_column_names().iter().any(|c| c.as_str() == col.as_str());
                        let is_key = col.contains("ID") || Some(col.as_str()) == period_column;
                        if collides && !is_key {
                            df_temp
                                .rename(col, format!("{}-{}", spec.table, col).into())
                                .map_err(|e| wrap(e.into()))?;
                        }
                    }
                }

                let temp_cols: Vec<String> =
                    df_temp.get_column_names().iter().map(|s| s.to_string()).collect();
                let prefix = format!("{}-", spec.table);
                let mut keys: Vec<String> =
                    acc_cols.iter().filter(|c| c.contains("ID")).cloned().collect();
                for col in &acc_cols {
                    if temp_cols.contains(col) && !col.starts_with(&prefix) && !keys.contains(col) {
                        keys.push(col.clone());
                    }
                }
                if keys.is_empty() {
                    return Err(wrap(AppError::data(
                        "no_join_keys".to_string(),
                        "no shared columns to join on".to_string(),
                    )));
                }
                for k in &keys {
                    if !temp_cols.contains(k) {
                        return Err(wrap(AppError::data(
                            "missing_join_key".to_string(),
                            format!("join column '{}' is missing", k),
                        )));
                    }
                }
                debug!(target: "hydrolens::merge", "joining '{}' on {:?}", key, keys);

                let key_refs: Vec<&str> = keys.iter().map(|s| s.as_str()).collect();
                let joined = df
                    .join(&df_temp, key_refs.clone(), key_refs, JoinType::Inner.into(), None)
                    .map_err(|e| wrap(e.into()))?;
                drop_null_rows(joined).map_err(|e| wrap(e.into()))?
            }
        });
    }

    Ok(acc.unwrap_or_else(DataFrame::empty))
}
