use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::{BrokerReply, CatalogClient};
use crate::domain::Credential;
use crate::error::WekeoError;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatasetSummary {
    #[serde(rename = "datasetId")]
    pub dataset_id: String,
    #[serde(rename = "abstract", default)]
    pub description: Option<String>,
    #[serde(rename = "previewImage", default)]
    pub preview_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatasetPage {
    #[serde(default)]
    content: Vec<DatasetSummary>,
}

pub struct Catalog<'a, C: CatalogClient> {
    client: &'a C,
}

impl<'a, C: CatalogClient> Catalog<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub fn list(&self, size: usize) -> Result<Vec<DatasetSummary>, WekeoError> {
        let reply = success(self.client.list_datasets(size)?)?;
        let page: DatasetPage = serde_json::from_str(&reply.body)
            .map_err(|err| WekeoError::BrokerHttp(format!("dataset listing: {err}")))?;
        Ok(page.content)
    }

    /// Datasets whose id contains `name`, ignoring case.
    pub fn search(&self, size: usize, name: &str) -> Result<Vec<DatasetSummary>, WekeoError> {
        let needle = name.to_lowercase();
        Ok(self
            .list(size)?
            .into_iter()
            .filter(|dataset| dataset.dataset_id.to_lowercase().contains(&needle))
            .collect())
    }

    pub fn metadata(&self, dataset_id: &str, credential: &Credential) -> Result<Value, WekeoError> {
        let reply = success(self.client.query_metadata(dataset_id, credential)?)?;
        reply
            .json()
            .map_err(|err| WekeoError::BrokerHttp(format!("metadata for {dataset_id}: {err}")))
    }
}

fn success(reply: BrokerReply) -> Result<BrokerReply, WekeoError> {
    let reply = reply.check_auth()?;
    if !reply.is_success() {
        return Err(WekeoError::BrokerStatus {
            status: reply.status,
            message: reply.body,
        });
    }
    Ok(reply)
}

/// Value keys of the first multi-select parameter, across all its groups.
pub fn multi_select_values(metadata: &Value) -> Vec<String> {
    metadata
        .pointer("/parameters/multiStringSelects/0/details/groupedValueLabels")
        .and_then(|groups| groups.as_array())
        .map(|groups| {
            groups
                .iter()
                .filter_map(|group| group.get("valuesLabels").and_then(|v| v.as_object()))
                .flat_map(|labels| labels.keys().cloned())
                .collect()
        })
        .unwrap_or_default()
}
