//! Spatial-scale handling: area-weighted roll-up of subarea rows to field
//! rows, the reach-scale watershed-average filter, and the unknown-scale
//! rejection.

use polars::prelude::*;
use rusqlite::Connection;
use tracing::debug;

use crate::catalog::{quote_ident, ProjectContext};
use crate::df_utils;
use crate::error::{AppError, AppResult};
use crate::request::SpatialScale;

use super::fetch;

pub fn apply_spatial_scale(
    ctx: &ProjectContext,
    df: DataFrame,
    scale: Option<SpatialScale>,
    field_ids: &[String],
    id_column: &str,
    period_column: Option<&str>,
) -> AppResult<DataFrame> {
    match scale {
        Some(SpatialScale::Field) => field_rollup(ctx, df, field_ids, id_column, period_column)
            .map_err(|e| {
                AppError::data(
                    "field_rollup".to_string(),
                    format!("Error processing field values: {}", e.message()),
                )
            }),
        Some(SpatialScale::Reach) => {
            // Identifier 0 is reserved for the whole-watershed average row.
            let col = df.column(id_column)?.clone();
            let mask: BooleanChunked = match col.dtype() {
                DataType::Int64 => col.i64()?.into_iter().map(|o| Some(o != Some(0))).collect(),
                DataType::Float64 => col.f64()?.into_iter().map(|o| Some(o != Some(0.0))).collect(),
                _ => col.str()?.into_iter().map(|o| Some(o != Some("0"))).collect(),
            };
            Ok(df.filter(&mask)?)
        }
        Some(SpatialScale::Unknown) => Err(AppError::validation(
            "unknown_scale",
            "Spatial scale is unknown. Please select a valid spatial scale.",
        )),
        Some(SpatialScale::Subarea) | Some(SpatialScale::Subbasin) | None => Ok(df),
    }
}

/// Numeric feature columns of the merged frame, excluding the identifier and
/// period columns.
fn numeric_feature_columns(df: &DataFrame, id_column: &str, period_column: Option<&str>) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|c| {
            let name = c.as_str();
            if name == id_column || Some(name) == period_column {
                return false;
            }
            matches!(
                df.column(name).map(|col| col.dtype().clone()),
                Ok(DataType::Int64) | Ok(DataType::Float64)
            )
        })
        .map(|c| c.to_string())
        .collect()
}

/// Area-weighted re-aggregation from subarea rows to field rows.
///
/// Each subarea contributes its value scaled by `area / field_total_area`;
/// summing those contributions per (field, period) yields a true
/// area-weighted average because the fractions of one field sum to 1.
fn field_rollup(
    ctx: &ProjectContext,
    df: DataFrame,
    field_ids: &[String],
    id_column: &str,
    period_column: Option<&str>,
) -> AppResult<DataFrame> {
    let bmp_rel = ctx.bmp_db().ok_or_else(|| {
        AppError::schema("missing_bmp", "no BMP database with a Subarea table has been discovered")
    })?;
    let bmp_path = ctx.db_path(&bmp_rel)?;
    let conn = Connection::open(&bmp_path)?;

    // The Subarea identifier column follows the project's naming, found by
    // the same contains-"id" convention used elsewhere.
    let subarea_cols = fetch::table_columns(&conn, "Subarea")?;
    let subarea_id = subarea_cols
        .iter()
        .find(|c| c.to_lowercase().contains("id"))
        .cloned()
        .unwrap_or_else(|| "ID".to_string());

    let mut sql = format!(
        "SELECT {} AS {}, FieldId, Area FROM Subarea",
        quote_ident(&subarea_id),
        quote_ident(id_column)
    );
    let mut params: Vec<String> = Vec::new();
    if !field_ids.is_empty() {
        let placeholders = vec!["?"; field_ids.len()].join(",");
        sql.push_str(&format!(" WHERE FieldId IN ({})", placeholders));
        params.extend(field_ids.iter().cloned());
    }
    let subarea = fetch::read_query(&conn, &sql, &params)?;

    for required in [id_column, "FieldId", "Area"] {
        if !subarea.get_column_names().iter().any(|c| c.as_str() == required) {
            return Err(AppError::schema(
                "subarea_columns",
                "Subarea table does not contain the required columns: ID, FieldId, Area",
            ));
        }
    }

    // Total area per field, then each subarea's share of it.
    let totals = subarea
        .clone()
        .lazy()
        .group_by([col("FieldId")])
        .agg([col("Area").cast(DataType::Float64).sum().alias("Total_Area")])
        .collect()?;
    let subarea = subarea.join(&totals, vec!["FieldId"], vec!["FieldId"], JoinType::Inner.into(), None)?;
    let subarea = subarea
        .lazy()
        .with_columns([(col("Area").cast(DataType::Float64) / col("Total_Area"))
            .alias("__area_fraction")])
        .collect()?;

    // Subarea-level values from the merged frame: identifier, period and the
    // numeric feature columns only.
    let value_cols = numeric_feature_columns(&df, id_column, period_column);
    let mut selection: Vec<String> = vec![id_column.to_string()];
    if let Some(p) = period_column {
        selection.push(p.to_string());
    }
    selection.extend(value_cols.iter().cloned());
    let values = df.select(selection)?;

    let joined = subarea.join(
        &values,
        vec![id_column],
        vec![id_column],
        JoinType::Left.into(),
        None,
    )?;

    let weighted_exprs: Vec<Expr> = value_cols
        .iter()
        .map(|n| (col(n.as_str()).cast(DataType::Float64) * col("__area_fraction")).alias(n.as_str()))
        .collect();
    let mut group_exprs: Vec<Expr> = vec![col("FieldId")];
    if let Some(p) = period_column {
        group_exprs.push(col(p));
    }
    let sum_exprs: Vec<Expr> = value_cols.iter().map(|n| col(n.as_str()).sum()).collect();

    let mut rolled = joined
        .lazy()
        .with_columns(weighted_exprs)
        .group_by(group_exprs)
        .agg(sum_exprs)
        .collect()?;

    rolled.rename("FieldId", id_column.into())?;
    let mut order: Vec<String> = vec![id_column.to_string()];
    if let Some(p) = period_column {
        order.push(p.to_string());
    }
    let mut out = rolled.select({
        let mut sel = order.clone();
        sel.extend(value_cols.iter().cloned());
        sel
    })?;
    out = out.sort(order, SortMultipleOptions::default())?;
    debug!(target: "hydrolens::spatial", "field roll-up: {} subarea rows -> {} field rows", df.height(), out.height());
    Ok(df_utils::round_dataframe(out)?)
}
