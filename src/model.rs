use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One extracted row, as returned by the source API.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Salesforce,
    Zoho,
    SugarCrm,
    MetaAds,
    GitHub,
    Notion,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Salesforce => "salesforce",
            Provider::Zoho => "zoho",
            Provider::SugarCrm => "sugarcrm",
            Provider::MetaAds => "meta_ads",
            Provider::GitHub => "github",
            Provider::Notion => "notion",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "salesforce" => Ok(Provider::Salesforce),
            "zoho" => Ok(Provider::Zoho),
            "sugarcrm" | "sugar" => Ok(Provider::SugarCrm),
            "meta_ads" | "meta-ads" | "metaads" | "meta" => Ok(Provider::MetaAds),
            "github" => Ok(Provider::GitHub),
            "notion" => Ok(Provider::Notion),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionType {
    Full,
    Incremental,
}

impl ExtractionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionType::Full => "full",
            ExtractionType::Incremental => "incremental",
        }
    }
}

impl FromStr for ExtractionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ExtractionType::Full),
            "incremental" => Ok(ExtractionType::Incremental),
            other => Err(format!("unknown extraction type: {}", other)),
        }
    }
}

/// Query knobs understood by connectors. Each connector uses the subset its API supports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParams {
    pub fields: Vec<String>,
    pub where_clause: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<u32>,
    pub filters: Option<Value>,
}

impl QueryParams {
    pub fn with_fields(fields: Vec<String>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nillable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub createable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updateable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FieldInfo {
    pub fn typed(typ: &str) -> Self {
        Self {
            typ: Some(typ.to_string()),
            ..Default::default()
        }
    }

    pub fn described(typ: &str, description: &str) -> Self {
        Self {
            typ: Some(typ.to_string()),
            description: Some(description.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectSchema {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub fields: BTreeMap<String, FieldInfo>,
    pub timestamp: DateTime<Utc>,
}

/// Entry in a connector's object catalog (repo, database, module).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataQuality {
    pub total_records: usize,
    pub null_values: BTreeMap<String, usize>,
    pub duplicate_keys: usize,
    pub validation_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectResult {
    pub object_name: String,
    pub extraction_type: ExtractionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_date: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub record_count: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<DataQuality>,
}

impl ObjectResult {
    pub fn started(object_name: &str, extraction_type: ExtractionType, since: Option<&str>) -> Self {
        Self {
            object_name: object_name.to_string(),
            extraction_type,
            since_date: since.map(str::to_string),
            start_time: Utc::now(),
            end_time: None,
            record_count: 0,
            success: false,
            storage_path: None,
            message: None,
            error: None,
            data_quality: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionSummary {
    pub success: bool,
    pub extraction_type: ExtractionType,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub object_results: BTreeMap<String, ObjectResult>,
    pub errors: Vec<String>,
    pub execution_time_seconds: f64,
}

impl ExtractionSummary {
    pub fn total_records(&self) -> usize {
        self.object_results.values().map(|r| r.record_count).sum()
    }

    pub fn successful_objects(&self) -> usize {
        self.object_results.values().filter(|r| r.success).count()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "PENDING",
            PipelineState::Running => "RUNNING",
            PipelineState::Completed => "COMPLETED",
            PipelineState::Failed => "FAILED",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(PipelineState::Pending),
            "RUNNING" => Some(PipelineState::Running),
            "COMPLETED" => Some(PipelineState::Completed),
            "FAILED" => Some(PipelineState::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_lenient() {
        assert_eq!("Salesforce".parse::<Provider>().unwrap(), Provider::Salesforce);
        assert_eq!("meta-ads".parse::<Provider>().unwrap(), Provider::MetaAds);
        assert_eq!(" GitHub ".parse::<Provider>().unwrap(), Provider::GitHub);
        assert!("airtable".parse::<Provider>().is_err());
    }

    #[test]
    fn extraction_type_parse() {
        assert_eq!("INCREMENTAL".parse::<ExtractionType>().unwrap(), ExtractionType::Incremental);
        assert!("delta".parse::<ExtractionType>().is_err());
    }

    #[test]
    fn pipeline_state_round_trips_through_str() {
        for s in [
            PipelineState::Pending,
            PipelineState::Running,
            PipelineState::Completed,
            PipelineState::Failed,
        ] {
            assert_eq!(PipelineState::parse_state(s.as_str()), Some(s));
        }
        assert_eq!(PipelineState::parse_state("OPEN"), None);
    }
}
