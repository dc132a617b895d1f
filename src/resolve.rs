use serde_json::Value;
use tracing::info;

use crate::broker::BrokerClient;
use crate::domain::{Credential, JobHandle, ManifestEntry, ResultManifest};
use crate::error::WekeoError;

pub struct ResultResolver<'a, C: BrokerClient> {
    client: &'a C,
}

impl<'a, C: BrokerClient> ResultResolver<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Fetches the manifest of a job the poller reported as completed.
    pub fn resolve(
        &self,
        job: &JobHandle,
        credential: &Credential,
    ) -> Result<ResultManifest, WekeoError> {
        let reply = self.client.fetch_result(job, credential)?.check_auth()?;
        if !reply.is_success() {
            return Err(WekeoError::BrokerStatus {
                status: reply.status,
                message: reply.body,
            });
        }
        let manifest = parse_manifest(&reply.body)?;
        info!(job = %job, url = %manifest.primary().url, "result resolved");
        Ok(manifest)
    }
}

/// Parses `{"content": [{"url", "filename", ...}]}`. The first entry must be
/// complete; later incomplete entries are dropped.
pub fn parse_manifest(body: &str) -> Result<ResultManifest, WekeoError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| WekeoError::Manifest(format!("{err}: {body}")))?;
    let content = value
        .get("content")
        .and_then(|content| content.as_array())
        .ok_or_else(|| WekeoError::Manifest(format!("missing content array: {body}")))?;
    let (first, rest) = content
        .split_first()
        .ok_or_else(|| WekeoError::Manifest(format!("empty content array: {body}")))?;

    let primary = parse_entry(first).ok_or_else(|| {
        WekeoError::Manifest(format!("first entry lacks url or filename: {body}"))
    })?;
    let mut entries = vec![primary];
    entries.extend(rest.iter().filter_map(parse_entry));
    ResultManifest::new(entries)
}

fn parse_entry(value: &Value) -> Option<ManifestEntry> {
    let field = |name: &str| {
        value
            .get(name)
            .and_then(|field| field.as_str())
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
    };
    Some(ManifestEntry {
        url: field("url")?,
        filename: field("filename")?,
        size: value.get("size").and_then(|size| size.as_u64()),
    })
}
