//!
//! hydrolens engine module
//! -----------------------
//! The request pipeline: per-table fetch, multi-table merge, optional
//! spatial re-aggregation, optional derived-feature formula, optional
//! temporal resampling/statistics, and the metadata operations that prepare
//! a request. Each stage returns `AppResult` and the fold stops at the first
//! failure; the public operations convert any failure into the
//! `{"error": message}` payload, so no error crosses this boundary uncaught.

pub mod fetch;
pub mod formula;
pub mod merge;
pub mod metadata;
pub mod spatial;
pub mod temporal;


use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog::{scan, ProjectContext};
use crate::df_utils;
use crate::error::{AppError, AppResult};
use crate::request::{
    DataResponse, FetchDataRequest, Interval, MultiMetadataRequest, ScanRequest, SpatialScale,
    Statistic, TableNamesRequest,
};
use self::temporal::StatsTable;

/// Map a stage result onto the boundary payload.
pub fn respond<T: Serialize>(result: AppResult<T>) -> Value {
    match result {
        Ok(v) => serde_json::to_value(v)
            .unwrap_or_else(|e| json!({ "error": e.to_string() })),
        Err(e) => e.payload(),
    }
}

fn non_time_series() -> AppError {
    AppError::validation(
        "non_time_series",
        "Time conversion and statistics cannot be performed for non-time series data",
    )
}

/// Fetch data and statistics from the requested databases and tables.
pub fn fetch_data(ctx: &ProjectContext, req: &FetchDataRequest) -> Value {
    respond(run_fetch_data(ctx, req))
}

pub fn run_fetch_data(ctx: &ProjectContext, req: &FetchDataRequest) -> AppResult<DataResponse> {
    let period = req.period_column();

    // At field scale the request's ids are field ids; the subarea fetch
    // itself is unfiltered and the roll-up applies the field selection.
    let (selected_ids, field_ids) = match req.spatial_scale {
        Some(SpatialScale::Field) => (Vec::new(), req.selected_ids.clone()),
        _ => (req.selected_ids.clone(), req.field_selected_ids.clone()),
    };

    let df = merge::merge_tables(
        ctx,
        &req.db_tables,
        &req.columns,
        &selected_ids,
        &req.id_column,
        req.start_date.as_deref(),
        req.end_date.as_deref(),
        period,
    )?;
    if df.height() == 0 {
        return Err(AppError::data("empty_result", "No data found for the specified filters."));
    }
    debug!(target: "hydrolens::engine", "merged {} rows x {} columns", df.height(), df.width());

    let df = spatial::apply_spatial_scale(ctx, df, req.spatial_scale, &field_ids, &req.id_column, period)?;

    let (mut df, new_feature) = match req.math_formula.as_deref().filter(|f| !f.trim().is_empty()) {
        Some(f) => formula::apply_formula(ctx, df, f, &req.db_tables, &req.id_column)?,
        None => (df, String::new()),
    };

    // A changed aggregation method with a non-daily interval resamples and
    // takes precedence; otherwise a non-empty statistics set runs the plain
    // statistics path. Both need the period column.
    let mut stats: Option<StatsTable> = None;
    let resample_requested =
        !req.method.contains(&Statistic::Equal) && req.interval != Interval::Daily;
    let stats_requested = req.statistics.iter().any(|s| !matches!(s, Statistic::None));
    if resample_requested {
        let pc = period.ok_or_else(non_time_series)?;
        let (resampled, stats_table) =
            temporal::resample(df, req.interval, &req.method, pc, req.month, req.season.as_deref())?;
        df = resampled;
        stats = Some(stats_table);
    } else if stats_requested {
        let pc = period.ok_or_else(non_time_series)?;
        stats = Some(temporal::statistics(&df, &req.statistics, pc)?);
    }

    let df = df_utils::round_dataframe(df)?;
    let (data, _) = df_utils::dataframe_rows(&df);
    let (stats_rows, stats_columns) = match stats {
        Some(s) => (s.rows, s.columns),
        None => (Vec::new(), Vec::new()),
    };
    Ok(DataResponse { data, new_feature, stats: stats_rows, stats_columns })
}

/// Combined metadata for every table of a request; also maintains the
/// schema cache consulted by the merge engine.
pub fn multi_metadata(ctx: &ProjectContext, req: &MultiMetadataRequest) -> Value {
    respond(metadata::multi_columns_and_time_range(ctx, &req.db_tables))
}

pub fn table_names(ctx: &ProjectContext, req: &TableNamesRequest) -> Value {
    respond(metadata::table_names(ctx, &req.db_path).map(|tables| json!({ "tables": tables })))
}

pub fn scan_project(ctx: &ProjectContext, req: &ScanRequest) -> Value {
    let folder = req.folder_path.clone().unwrap_or_else(|| ctx.config.project_folder.clone());
    respond(
        scan::scan_project(ctx, &folder).map(|nodes| json!({ "files_and_folders": nodes })),
    )
}
