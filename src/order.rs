use tracing::info;

use crate::broker::BrokerClient;
use crate::domain::{Credential, JobHandle, ResultManifest};
use crate::error::WekeoError;

/// Places the explicit order some datasets need before their URL serves data.
pub struct DataOrderer<'a, C: BrokerClient> {
    client: &'a C,
}

impl<'a, C: BrokerClient> DataOrderer<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    pub fn order(
        &self,
        job: &JobHandle,
        manifest: &ResultManifest,
        credential: &Credential,
    ) -> Result<String, WekeoError> {
        let uri = &manifest.primary().url;
        let reply = self.client.post_order(job, uri, credential)?.check_auth()?;
        let order_id = reply
            .is_success()
            .then(|| reply.json().ok())
            .flatten()
            .and_then(|value| {
                value
                    .get("orderId")
                    .and_then(|id| id.as_str())
                    .filter(|id| !id.trim().is_empty())
                    .map(str::to_string)
            });
        match order_id {
            Some(order_id) => {
                info!(job = %job, order = %order_id, "data order placed");
                Ok(order_id)
            }
            None => Err(WekeoError::Order {
                status: reply.status,
                message: reply.body,
            }),
        }
    }
}
