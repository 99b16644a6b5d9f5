//! Interval resampling (monthly/yearly/seasonal) and summary statistics.
//!
//! Resampling groups by the identifier column plus calendar keys derived
//! from the period column and sums the numeric columns; seasons follow the
//! meteorological convention with quarters anchored at December. After
//! resampling the period column is reformatted (`%Y` yearly, `%Y-%m`
//! monthly/seasonal, `%Y-%m-%d` otherwise).

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::df_utils::{self, round_value};
use crate::error::{AppError, AppResult};
use crate::request::{Interval, Statistic};

/// Transposed summary: one row per statistic, one column per numeric column,
/// led by the "Statistics" label column.
#[derive(Debug, Clone, Serialize)]
pub struct StatsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

impl StatsTable {
    pub fn empty() -> Self {
        StatsTable { columns: Vec::new(), rows: Vec::new() }
    }
}

/// Lenient period parsing: the scenario stores keep dates as text in a
/// handful of layouts.
pub fn parse_period(raw: &str) -> AppResult<NaiveDate> {
    let s = raw.trim();
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(d);
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d") {
        return Ok(d);
    }
    if s.len() == 4 {
        if let Ok(y) = s.parse::<i32>() {
            if let Some(d) = NaiveDate::from_ymd_opt(y, 1, 1) {
                return Ok(d);
            }
        }
    }
    Err(AppError::data("bad_period".to_string(), format!("cannot interpret period value '{}'", raw)))
}

pub fn season_of(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Winter",
        3 | 4 | 5 => "Spring",
        6 | 7 | 8 => "Summer",
        _ => "Autumn",
    }
}

/// Start of the December-anchored quarter containing the date:
/// DJF -> Dec of the previous year, MAM -> Mar, JJA -> Jun, SON -> Sep.
pub fn quarter_start(d: NaiveDate) -> (i32, u32) {
    match d.month() {
        12 => (d.year(), 12),
        1 | 2 => (d.year() - 1, 12),
        3..=5 => (d.year(), 3),
        6..=8 => (d.year(), 6),
        _ => (d.year(), 9),
    }
}

fn title_case(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => lower,
    }
}

fn identifier_column(df: &DataFrame) -> String {
    df.get_column_names()
        .iter()
        .find(|c| c.as_str().contains("ID"))
        .map(|c| c.to_string())
        .unwrap_or_else(|| "ID".to_string())
}

fn numeric_columns(df: &DataFrame, exclude: &[&str]) -> Vec<String> {
    df.get_column_names()
        .iter()
        .filter(|c| !exclude.contains(&c.as_str()))
        .filter(|c| {
            matches!(
                df.column(c.as_str()).map(|col| col.dtype().clone()),
                Ok(DataType::Int64) | Ok(DataType::Float64)
            )
        })
        .map(|c| c.to_string())
        .collect()
}

fn period_dates(df: &DataFrame, period_column: &str) -> AppResult<Vec<NaiveDate>> {
    let col = df.column(period_column)?.cast(&DataType::String)?;
    let ca = col.str()?;
    let mut dates = Vec::with_capacity(df.height());
    for opt in ca.into_iter() {
        let raw = opt.ok_or_else(|| {
            AppError::data("bad_period", "period column contains empty values")
        })?;
        dates.push(parse_period(raw)?);
    }
    Ok(dates)
}

fn filter_eq_i32(df: DataFrame, column: &str, value: i32) -> PolarsResult<DataFrame> {
    let mask: BooleanChunked =
        df.column(column)?.i32()?.into_iter().map(|o| Some(o == Some(value))).collect();
    df.filter(&mask)
}

fn filter_eq_str(df: DataFrame, column: &str, value: &str) -> PolarsResult<DataFrame> {
    let mask: BooleanChunked =
        df.column(column)?.str()?.into_iter().map(|o| Some(o == Some(value))).collect();
    df.filter(&mask)
}

/// Resample to the requested interval and compute the statistics named by
/// the aggregation method list over the resampled table.
pub fn resample(
    df: DataFrame,
    interval: Interval,
    method: &[Statistic],
    period_column: &str,
    month: Option<u32>,
    season: Option<&str>,
) -> AppResult<(DataFrame, StatsTable)> {
    let id_col = identifier_column(&df);
    let dates = period_dates(&df, period_column)?;
    let numeric = numeric_columns(&df, &[id_col.as_str(), period_column]);

    let resampled = match interval {
        Interval::Daily => {
            // Reformat only.
            let labels: Vec<String> =
                dates.iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
            let mut out = df;
            out.replace(period_column, Series::new(period_column.into(), labels))?;
            out
        }
        Interval::Monthly | Interval::Yearly => {
            let years: Vec<i32> = dates.iter().map(|d| d.year()).collect();
            let mut tmp = df;
            tmp.with_column(Series::new("__year".into(), years))?;
            let mut keys = vec![id_col.clone(), "__year".to_string()];
            if interval == Interval::Monthly {
                let months: Vec<i32> = dates.iter().map(|d| d.month() as i32).collect();
                tmp.with_column(Series::new("__month".into(), months))?;
                keys.push("__month".to_string());
            }
            let gb: Vec<Expr> = keys.iter().map(|k| col(k.as_str())).collect();
            let aggs: Vec<Expr> = numeric.iter().map(|n| col(n.as_str()).sum()).collect();
            let mut out = tmp.lazy().group_by(gb).agg(aggs).collect()?;
            out = out.sort(keys.clone(), SortMultipleOptions::default())?;
            if interval == Interval::Monthly {
                if let Some(m) = month {
                    out = filter_eq_i32(out, "__month", m as i32)?;
                }
            }
            let labels: Vec<String> = {
                let years = out.column("__year")?.i32()?;
                match interval {
                    Interval::Monthly => {
                        let months = out.column("__month")?.i32()?;
                        years
                            .into_iter()
                            .zip(months)
                            .map(|(y, m)| format!("{:04}-{:02}", y.unwrap_or(0), m.unwrap_or(0)))
                            .collect()
                    }
                    _ => years.into_iter().map(|y| format!("{:04}", y.unwrap_or(0))).collect(),
                }
            };
            out.with_column(Series::new(period_column.into(), labels))?;
            let mut sel = vec![id_col.clone(), period_column.to_string()];
            sel.extend(numeric.iter().cloned());
            out.select(sel)?
        }
        Interval::Seasonally => {
            let seasons: Vec<&str> = dates.iter().map(|d| season_of(d.month())).collect();
            let quarters: Vec<(i32, u32)> = dates.iter().map(|d| quarter_start(*d)).collect();
            let qy: Vec<i32> = quarters.iter().map(|(y, _)| *y).collect();
            let qm: Vec<i32> = quarters.iter().map(|(_, m)| *m as i32).collect();
            let mut tmp = df;
            tmp.with_column(Series::new("Season".into(), seasons))?;
            tmp.with_column(Series::new("__qy".into(), qy))?;
            tmp.with_column(Series::new("__qm".into(), qm))?;
            let keys =
                [id_col.as_str(), "Season", "__qy", "__qm"];
            let gb: Vec<Expr> = keys.iter().map(|k| col(*k)).collect();
            let aggs: Vec<Expr> = numeric.iter().map(|n| col(n.as_str()).sum()).collect();
            let mut out = tmp.lazy().group_by(gb).agg(aggs).collect()?;
            out = out.sort(
                keys.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                SortMultipleOptions::default(),
            )?;
            if let Some(s) = season {
                out = filter_eq_str(out, "Season", &title_case(s))?;
            }
            let labels: Vec<String> = {
                let years = out.column("__qy")?.i32()?;
                let months = out.column("__qm")?.i32()?;
                years
                    .into_iter()
                    .zip(months)
                    .map(|(y, m)| format!("{:04}-{:02}", y.unwrap_or(0), m.unwrap_or(0)))
                    .collect()
            };
            out.with_column(Series::new(period_column.into(), labels))?;
            let mut sel = vec![id_col.clone(), "Season".to_string(), period_column.to_string()];
            sel.extend(numeric.iter().cloned());
            out.select(sel)?
        }
    };

    let resampled = df_utils::round_dataframe(resampled)?;
    let stats = statistics(&resampled, method, period_column)?;
    Ok((resampled, stats))
}

/// Compute the requested statistics per numeric column (the period column
/// excluded). Maximum/Minimum additionally report the period value at which
/// the extreme occurred, looked up by row index in the given table.
pub fn statistics(
    df: &DataFrame,
    requested: &[Statistic],
    period_column: &str,
) -> AppResult<StatsTable> {
    let numeric = numeric_columns(df, &[period_column]);
    let has_period = df.get_column_names().iter().any(|c| c.as_str() == period_column);

    struct ColSummary {
        name: String,
        mean: Option<f64>,
        sum: Option<f64>,
        max: Option<f64>,
        max_idx: Option<usize>,
        min: Option<f64>,
        min_idx: Option<usize>,
        std: Option<f64>,
    }

    let mut summaries = Vec::with_capacity(numeric.len());
    for name in &numeric {
        let casted = df.column(name)?.cast(&DataType::Float64)?;
        let ca = casted.f64()?;
        let mut max: Option<(usize, f64)> = None;
        let mut min: Option<(usize, f64)> = None;
        for (i, opt) in ca.into_iter().enumerate() {
            if let Some(v) = opt {
                if v.is_nan() {
                    continue;
                }
                if max.map(|(_, m)| v > m).unwrap_or(true) {
                    max = Some((i, v));
                }
                if min.map(|(_, m)| v < m).unwrap_or(true) {
                    min = Some((i, v));
                }
            }
        }
        summaries.push(ColSummary {
            name: name.clone(),
            mean: ca.mean(),
            sum: ca.sum(),
            max: max.map(|(_, v)| v),
            max_idx: max.map(|(i, _)| i),
            min: min.map(|(_, v)| v),
            min_idx: min.map(|(i, _)| i),
            std: ca.std(1),
        });
    }

    let num = |v: Option<f64>| -> Value {
        match v {
            Some(x) if x.is_finite() => serde_json::json!(round_value(x)),
            _ => Value::Null,
        }
    };
    let mut rows: Vec<Map<String, Value>> = Vec::new();
    let mut push_row = |label: String, cell: &dyn Fn(&ColSummary) -> Value| {
        let mut row = Map::with_capacity(numeric.len() + 1);
        row.insert("Statistics".to_string(), Value::String(label));
        for s in &summaries {
            row.insert(s.name.clone(), cell(s));
        }
        rows.push(row);
    };

    let wants = |s: Statistic| requested.contains(&s);
    if wants(Statistic::Average) {
        push_row("Average".to_string(), &|s| num(s.mean));
    }
    if wants(Statistic::Sum) {
        push_row("Sum".to_string(), &|s| num(s.sum));
    }
    if wants(Statistic::Maximum) {
        push_row("Maximum".to_string(), &|s| num(s.max));
        if has_period {
            push_row(format!("Maximum {}", period_column), &|s| {
                s.max_idx
                    .and_then(|i| df_utils::cell_string(df, period_column, i))
                    .map(Value::String)
                    .unwrap_or(Value::Null)
            });
        }
    }
    if wants(Statistic::Minimum) {
        push_row("Minimum".to_string(), &|s| num(s.min));
        if has_period {
            push_row(format!("Minimum {}", period_column), &|s| {
                s.min_idx
                    .and_then(|i| df_utils::cell_string(df, period_column, i))
                    .map(Value::String)
                    .unwrap_or(Value::Null)
            });
        }
    }
    if wants(Statistic::StandardDeviation) {
        push_row("Standard Deviation".to_string(), &|s| num(s.std));
    }

    let mut columns = vec!["Statistics".to_string()];
    columns.extend(numeric);
    Ok(StatsTable { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn period_parsing_accepts_common_layouts() {
        assert_eq!(parse_period("2021-03-05").unwrap(), date(2021, 3, 5));
        assert_eq!(parse_period("2021-03-05 12:30:00").unwrap(), date(2021, 3, 5));
        assert_eq!(parse_period("2021-03").unwrap(), date(2021, 3, 1));
        assert_eq!(parse_period("2021").unwrap(), date(2021, 1, 1));
        assert!(parse_period("yesterday").is_err());
    }

    #[test]
    fn seasons_follow_meteorological_convention() {
        assert_eq!(season_of(12), "Winter");
        assert_eq!(season_of(1), "Winter");
        assert_eq!(season_of(2), "Winter");
        assert_eq!(season_of(3), "Spring");
        assert_eq!(season_of(5), "Spring");
        assert_eq!(season_of(6), "Summer");
        assert_eq!(season_of(8), "Summer");
        assert_eq!(season_of(9), "Autumn");
        assert_eq!(season_of(11), "Autumn");
    }

    #[test]
    fn quarters_anchor_at_december() {
        assert_eq!(quarter_start(date(2020, 12, 15)), (2020, 12));
        assert_eq!(quarter_start(date(2021, 1, 15)), (2020, 12));
        assert_eq!(quarter_start(date(2021, 2, 28)), (2020, 12));
        assert_eq!(quarter_start(date(2021, 3, 1)), (2021, 3));
        assert_eq!(quarter_start(date(2021, 9, 30)), (2021, 9));
    }

    fn sample_df() -> DataFrame {
        DataFrame::new(vec![
            Series::new("ID".into(), vec![1i64, 1, 1, 2]).into(),
            Series::new(
                "Time".into(),
                vec!["2021-01-05", "2021-01-20", "2021-02-01", "2021-01-05"],
            )
            .into(),
            Series::new("Flow".into(), vec![1.0f64, 2.0, 3.0, 4.0]).into(),
        ])
        .unwrap()
    }

    #[test]
    fn monthly_resample_sums_per_identifier_and_month() {
        let (out, _) =
            resample(sample_df(), Interval::Monthly, &[Statistic::Sum], "Time", None, None).unwrap();
        assert_eq!(
            out.get_column_names().iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            vec!["ID", "Time", "Flow"]
        );
        assert_eq!(out.height(), 3);
        let ids = out.column("ID").unwrap().i64().unwrap();
        let times = out.column("Time").unwrap().str().unwrap();
        let flows = out.column("Flow").unwrap().f64().unwrap();
        assert_eq!((ids.get(0), times.get(0), flows.get(0)), (Some(1), Some("2021-01"), Some(3.0)));
        assert_eq!((ids.get(1), times.get(1), flows.get(1)), (Some(1), Some("2021-02"), Some(3.0)));
        assert_eq!((ids.get(2), times.get(2), flows.get(2)), (Some(2), Some("2021-01"), Some(4.0)));
    }

    #[test]
    fn monthly_filter_keeps_one_month() {
        let (out, _) =
            resample(sample_df(), Interval::Monthly, &[Statistic::Sum], "Time", Some(2), None)
                .unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(out.column("Time").unwrap().str().unwrap().get(0), Some("2021-02"));
    }

    #[test]
    fn yearly_total_matches_sum_of_months() {
        // one identifier, data spread over a full year
        let days: Vec<String> = (1..=12)
            .flat_map(|m| {
                vec![format!("2021-{:02}-03", m), format!("2021-{:02}-17", m)]
            })
            .collect();
        let n = days.len();
        let values: Vec<f64> = (0..n).map(|i| (i as f64) + 0.5).collect();
        let df = DataFrame::new(vec![
            Series::new("ID".into(), vec![7i64; n]).into(),
            Series::new("Time".into(), days).into(),
            Series::new("Flow".into(), values.clone()).into(),
        ])
        .unwrap();

        let (monthly, _) =
            resample(df.clone(), Interval::Monthly, &[Statistic::Sum], "Time", None, None).unwrap();
        let (yearly, _) =
            resample(df, Interval::Yearly, &[Statistic::Sum], "Time", None, None).unwrap();

        let monthly_total: f64 =
            monthly.column("Flow").unwrap().f64().unwrap().into_iter().flatten().sum();
        let yearly_total = yearly.column("Flow").unwrap().f64().unwrap().get(0).unwrap();
        assert!((monthly_total - yearly_total).abs() < 1e-9);
        assert_eq!(yearly.column("Time").unwrap().str().unwrap().get(0), Some("2021"));
    }

    #[test]
    fn seasonal_resample_filters_and_labels() {
        let df = DataFrame::new(vec![
            Series::new("ID".into(), vec![1i64, 1, 1, 1]).into(),
            Series::new(
                "Time".into(),
                vec!["2020-12-10", "2021-01-15", "2021-02-20", "2021-07-04"],
            )
            .into(),
            Series::new("Flow".into(), vec![1.0f64, 2.0, 4.0, 8.0]).into(),
        ])
        .unwrap();
        let (out, _) = resample(
            df,
            Interval::Seasonally,
            &[Statistic::Sum],
            "Time",
            None,
            Some("winter"),
        )
        .unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(out.column("Season").unwrap().str().unwrap().get(0), Some("Winter"));
        assert_eq!(out.column("Time").unwrap().str().unwrap().get(0), Some("2020-12"));
        assert_eq!(out.column("Flow").unwrap().f64().unwrap().get(0), Some(7.0));
    }

    #[test]
    fn statistics_rows_are_transposed_with_period_lookup() {
        let df = DataFrame::new(vec![
            Series::new("ID".into(), vec![1i64, 1, 1]).into(),
            Series::new("Time".into(), vec!["2021-01-01", "2021-01-02", "2021-01-03"]).into(),
            Series::new("Flow".into(), vec![2.0f64, 8.0, 5.0]).into(),
        ])
        .unwrap();
        let stats = statistics(
            &df,
            &[
                Statistic::Average,
                Statistic::Sum,
                Statistic::Maximum,
                Statistic::Minimum,
                Statistic::StandardDeviation,
            ],
            "Time",
        )
        .unwrap();

        assert_eq!(stats.columns, vec!["Statistics".to_string(), "ID".into(), "Flow".into()]);
        let labels: Vec<&str> =
            stats.rows.iter().map(|r| r["Statistics"].as_str().unwrap()).collect();
        assert_eq!(
            labels,
            vec![
                "Average",
                "Sum",
                "Maximum",
                "Maximum Time",
                "Minimum",
                "Minimum Time",
                "Standard Deviation"
            ]
        );
        let by_label = |l: &str| stats.rows.iter().find(|r| r["Statistics"] == l).unwrap();
        assert_eq!(by_label("Average")["Flow"], serde_json::json!(5.0));
        assert_eq!(by_label("Sum")["Flow"], serde_json::json!(15.0));
        assert_eq!(by_label("Maximum")["Flow"], serde_json::json!(8.0));
        assert_eq!(by_label("Maximum Time")["Flow"], serde_json::json!("2021-01-02"));
        assert_eq!(by_label("Minimum Time")["Flow"], serde_json::json!("2021-01-01"));
        assert_eq!(by_label("Standard Deviation")["Flow"], serde_json::json!(3.0));
    }

    #[test]
    fn statistics_without_period_column_skip_extreme_lookup() {
        let df = DataFrame::new(vec![
            Series::new("ID".into(), vec![1i64, 2]).into(),
            Series::new("Flow".into(), vec![1.0f64, 3.0]).into(),
        ])
        .unwrap();
        let stats = statistics(&df, &[Statistic::Maximum], "Time").unwrap();
        let labels: Vec<&str> =
            stats.rows.iter().map(|r| r["Statistics"].as_str().unwrap()).collect();
        assert_eq!(labels, vec!["Maximum"]);
    }
}
