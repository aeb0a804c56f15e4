use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OrchestrationError;

/// Dataset types starting with this prefix are presets: pipelines whose status
/// mirrors the analyses queued beneath them.
pub const PRESET_PREFIX: &str = "preset-";

/// Owner assigned when the last explicit owner is removed.
pub const ANONYMOUS_OWNER: &str = "anonymous";

/// Owner names with this prefix refer to every user carrying the tag.
pub const TAG_OWNER_PREFIX: &str = "tag:";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerRole {
    #[default]
    Owner,
    Viewer,
}

impl OwnerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerRole::Owner => "owner",
            OwnerRole::Viewer => "viewer",
        }
    }
}

impl fmt::Display for OwnerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerRole {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(OwnerRole::Owner),
            "viewer" => Ok(OwnerRole::Viewer),
            other => Err(OrchestrationError::Internal(format!(
                "unknown owner role '{other}'"
            ))),
        }
    }
}

/// Follow-up analysis queued on a dataset's output once it finishes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    #[serde(rename = "type")]
    pub processor_type: String,
    #[serde(default)]
    pub parameters: DatasetParameters,
}

/// Query configuration of a dataset.
///
/// Fields the orchestration core reads are typed; everything else a processor
/// needs lives in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_flag: Option<String>,
    /// Preset dataset that receives this dataset's result when it finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<PipelineStep>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DatasetParameters {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn get_extra(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Flattened JSON object, keys in sorted order.
    pub fn to_sorted_map(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// Persisted dataset row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub key: String,
    /// Human-readable query label.
    pub query: String,
    pub parameters: DatasetParameters,
    pub result_file: String,
    pub creator: String,
    pub status: String,
    #[serde(rename = "type")]
    pub dataset_type: String,
    pub timestamp: i64,
    pub is_finished: bool,
    pub is_private: bool,
    pub software_version: String,
    pub software_file: String,
    pub num_rows: i64,
    pub progress: f64,
    /// Empty for top-level datasets.
    pub key_parent: String,
    pub job: Option<i64>,
}

impl DatasetRecord {
    pub fn is_top_dataset(&self) -> bool {
        self.key_parent.is_empty()
    }

    pub fn is_preset(&self) -> bool {
        self.dataset_type.starts_with(PRESET_PREFIX)
    }

    pub fn label(&self) -> &str {
        if let Some(label) = self.parameters.label.as_deref()
            && !label.is_empty()
        {
            return label;
        }
        if !self.query.is_empty() {
            return &self.query;
        }
        &self.dataset_type
    }
}

/// Single-statement update of a dataset row. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatasetPatch {
    pub query: Option<String>,
    pub parameters: Option<DatasetParameters>,
    pub result_file: Option<String>,
    pub status: Option<String>,
    pub timestamp: Option<i64>,
    pub is_finished: Option<bool>,
    pub is_private: Option<bool>,
    pub software_version: Option<String>,
    pub software_file: Option<String>,
    pub num_rows: Option<i64>,
    pub progress: Option<f64>,
    pub key_parent: Option<String>,
    pub job: Option<Option<i64>>,
}

impl DatasetPatch {
    pub fn is_empty(&self) -> bool {
        self == &DatasetPatch::default()
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, record: &mut DatasetRecord) {
        if let Some(query) = &self.query {
            record.query = query.clone();
        }
        if let Some(parameters) = &self.parameters {
            record.parameters = parameters.clone();
        }
        if let Some(result_file) = &self.result_file {
            record.result_file = result_file.clone();
        }
        if let Some(status) = &self.status {
            record.status = status.clone();
        }
        if let Some(timestamp) = self.timestamp {
            record.timestamp = timestamp;
        }
        if let Some(is_finished) = self.is_finished {
            record.is_finished = is_finished;
        }
        if let Some(is_private) = self.is_private {
            record.is_private = is_private;
        }
        if let Some(version) = &self.software_version {
            record.software_version = version.clone();
        }
        if let Some(file) = &self.software_file {
            record.software_file = file.clone();
        }
        if let Some(num_rows) = self.num_rows {
            record.num_rows = num_rows;
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(key_parent) = &self.key_parent {
            record.key_parent = key_parent.clone();
        }
        if let Some(job) = self.job {
            record.job = job;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameters_flatten_extra_keys() {
        let params = DatasetParameters::default()
            .with_label("cats")
            .with_extra("board", json!("pol"));
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"label": "cats", "board": "pol"}));

        let back: DatasetParameters = serde_json::from_value(value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn sorted_map_orders_keys() {
        let params = DatasetParameters::default()
            .with_extra("zeta", json!(1))
            .with_extra("alpha", json!(2))
            .with_label("m");
        let keys: Vec<_> = params.to_sorted_map().into_keys().collect();
        assert_eq!(keys, vec!["alpha", "label", "zeta"]);
    }

    #[test]
    fn owner_role_parses() {
        assert_eq!("viewer".parse::<OwnerRole>().unwrap(), OwnerRole::Viewer);
        assert!("admin".parse::<OwnerRole>().is_err());
    }
}
