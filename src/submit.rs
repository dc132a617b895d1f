use serde_json::Value;
use tracing::info;

use crate::broker::BrokerClient;
use crate::domain::{Credential, JobHandle};
use crate::error::WekeoError;
use crate::query::QueryDocument;

/// Posts query documents. Validation is left to the broker.
pub struct JobSubmitter<'a, C: BrokerClient> {
    client: &'a C,
}

impl<'a, C: BrokerClient> JobSubmitter<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub fn submit(
        &self,
        query: &QueryDocument,
        credential: &Credential,
    ) -> Result<JobHandle, WekeoError> {
        let reply = self
            .client
            .post_data_request(query, credential)?
            .check_auth()?;
        if !reply.is_success() {
            return Err(WekeoError::Submission {
                status: reply.status,
                message: reply.body,
            });
        }
        let job = extract_job_id(&reply.body).ok_or_else(|| WekeoError::Submission {
            status: reply.status,
            message: reply.body.clone(),
        })?;
        info!(job = %job, dataset = %query.dataset_id, "data request submitted");
        Ok(job)
    }
}

pub fn extract_job_id(body: &str) -> Option<JobHandle> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("jobId")?.as_str()?.parse().ok()
}
