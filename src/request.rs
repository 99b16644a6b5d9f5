//! Typed request and response payloads for the engine operations.
//!
//! Requests arrive pre-validated for type/format by the caller; the structs
//! here encode the optional-field rules as serde defaults so every operation
//! works from an explicit shape instead of an untyped dictionary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One (database file, table) pair of a multi-table request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTable {
    pub db: String,
    pub table: String,
}

/// Requested columns: the literal string "All" or an explicit list of
/// alias-form names (possibly `"{table}-{column}"`-prefixed).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ColumnSelection {
    #[default]
    All,
    Named(Vec<String>),
}

impl<'de> Deserialize<'de> for ColumnSelection {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Str(String),
            List(Vec<String>),
        }
        match Repr::deserialize(de)? {
            Repr::Str(s) if s == "All" => Ok(ColumnSelection::All),
            Repr::Str(s) => Ok(ColumnSelection::Named(vec![s])),
            Repr::List(v) => Ok(ColumnSelection::Named(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[default]
    Daily,
    Monthly,
    Yearly,
    Seasonally,
}

/// Statistic kinds, including the two request sentinels: `Equal` means "no
/// aggregation method change" and `None` means "no statistics requested".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statistic {
    Equal,
    None,
    Average,
    Sum,
    Maximum,
    Minimum,
    #[serde(rename = "Standard Deviation")]
    StandardDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialScale {
    Subarea,
    Subbasin,
    Field,
    Reach,
    Unknown,
}

fn default_id_column() -> String {
    "ID".to_string()
}

fn default_method() -> Vec<Statistic> {
    vec![Statistic::Equal]
}

fn default_statistics() -> Vec<Statistic> {
    vec![Statistic::None]
}

/// The main data request: which tables, columns, entities and date range,
/// plus the optional derived-formula, spatial and temporal transforms.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchDataRequest {
    pub db_tables: Vec<DbTable>,
    #[serde(default)]
    pub columns: ColumnSelection,
    #[serde(default, rename = "id")]
    pub selected_ids: Vec<String>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    /// Name of the period column (Time/Date/Month/Year); empty means the
    /// request is not a time series.
    #[serde(default)]
    pub date_type: Option<String>,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default = "default_method")]
    pub method: Vec<Statistic>,
    #[serde(default = "default_statistics")]
    pub statistics: Vec<Statistic>,
    #[serde(default)]
    pub month: Option<u32>,
    #[serde(default)]
    pub season: Option<String>,
    #[serde(default)]
    pub spatial_scale: Option<SpatialScale>,
    #[serde(default)]
    pub field_selected_ids: Vec<String>,
    #[serde(default)]
    pub math_formula: Option<String>,
}

impl FetchDataRequest {
    /// The period column, with empty strings treated as absent.
    pub fn period_column(&self) -> Option<&str> {
        self.date_type.as_deref().filter(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultiMetadataRequest {
    pub db_tables: Vec<DbTable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableNamesRequest {
    pub db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub folder_path: Option<String>,
}

/// Success payload of a data request.
#[derive(Debug, Clone, Serialize)]
pub struct DataResponse {
    pub data: Vec<Map<String, Value>>,
    pub new_feature: String,
    pub stats: Vec<Map<String, Value>>,
    #[serde(rename = "statsColumns")]
    pub stats_columns: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_accept_all_or_list() {
        let all: ColumnSelection = serde_json::from_value(serde_json::json!("All")).unwrap();
        assert_eq!(all, ColumnSelection::All);
        let named: ColumnSelection = serde_json::from_value(serde_json::json!(["ID", "Flow"])).unwrap();
        assert_eq!(named, ColumnSelection::Named(vec!["ID".into(), "Flow".into()]));
    }

    #[test]
    fn fetch_request_defaults() {
        let req: FetchDataRequest = serde_json::from_value(serde_json::json!({
            "db_tables": [{"db": "scenario.db3", "table": "Reach"}]
        }))
        .unwrap();
        assert_eq!(req.columns, ColumnSelection::All);
        assert_eq!(req.id_column, "ID");
        assert_eq!(req.interval, Interval::Daily);
        assert_eq!(req.method, vec![Statistic::Equal]);
        assert_eq!(req.statistics, vec![Statistic::None]);
        assert!(req.period_column().is_none());
    }

    #[test]
    fn statistic_names_match_request_vocabulary() {
        let s: Vec<Statistic> =
            serde_json::from_value(serde_json::json!(["Average", "Standard Deviation"])).unwrap();
        assert_eq!(s, vec![Statistic::Average, Statistic::StandardDeviation]);
    }

    #[test]
    fn empty_date_type_is_not_a_period() {
        let req: FetchDataRequest = serde_json::from_value(serde_json::json!({
            "db_tables": [], "date_type": ""
        }))
        .unwrap();
        assert!(req.period_column().is_none());
    }
}
