use std::io::Read;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};

use crate::domain::{Credential, JobHandle};
use crate::error::{WekeoError, is_retryable_status};
use crate::query::QueryDocument;

/// Raw broker response. Services decide what a status code means for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerReply {
    pub status: u16,
    pub body: String,
}

impl BrokerReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, 401 | 403)
    }

    /// Maps an auth rejection to `WekeoError::Auth`, otherwise passes through.
    pub fn check_auth(self) -> Result<Self, WekeoError> {
        if self.is_auth_failure() {
            return Err(WekeoError::Auth {
                status: self.status,
                message: self.body,
            });
        }
        Ok(self)
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Job endpoints of the broker. Every call is scoped by the credential.
pub trait BrokerClient: Send + Sync {
    fn post_data_request(
        &self,
        query: &QueryDocument,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError>;
    fn fetch_status(
        &self,
        job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError>;
    fn fetch_result(
        &self,
        job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError>;
    fn post_order(
        &self,
        job: &JobHandle,
        uri: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError>;
}

/// Catalog endpoints used to pick a dataset and build its query.
pub trait CatalogClient: Send + Sync {
    fn list_datasets(&self, size: usize) -> Result<BrokerReply, WekeoError>;
    fn query_metadata(
        &self,
        dataset_id: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError>;
}

/// Retrieves the content behind a manifest URL.
pub trait ContentFetcher: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, WekeoError>;
}

#[derive(Clone)]
pub struct BrokerHttpClient {
    client: Client,
    download_client: Client,
    base_url: String,
}

impl BrokerHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WekeoError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wekeo-broker/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WekeoError::BrokerHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(timeout)
            .build()
            .map_err(|err| WekeoError::BrokerHttp(err.to_string()))?;
        // Deliverables can take far longer than an API call to stream.
        let download_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|err| WekeoError::BrokerHttp(err.to_string()))?;

        Ok(Self {
            client,
            download_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `GET /gettoken` with HTTP Basic credentials.
    pub fn request_token(&self, username: &str, password: &str) -> Result<BrokerReply, WekeoError> {
        let url = self.endpoint("gettoken");
        self.send_with_retries(|| self.client.get(&url).basic_auth(username, Some(password)))
    }

    fn authorized(builder: RequestBuilder, credential: &Credential) -> RequestBuilder {
        builder.header(AUTHORIZATION, credential.header_value())
    }

    fn send_once(&self, request: RequestBuilder) -> Result<BrokerReply, WekeoError> {
        let response = request
            .send()
            .map_err(|err| WekeoError::BrokerHttp(err.to_string()))?;
        Self::into_reply(response)
    }

    fn into_reply(response: Response) -> Result<BrokerReply, WekeoError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|err| WekeoError::BrokerHttp(err.to_string()))?;
        Ok(BrokerReply { status, body })
    }

    fn send_download(&self, url: &str) -> Result<Response, WekeoError> {
        self.download_client
            .get(url)
            .send()
            .map_err(|err| WekeoError::BrokerHttp(err.to_string()))
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<BrokerReply, WekeoError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, "retrying broker request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Self::into_reply(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, attempt, "retrying broker request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(WekeoError::BrokerHttp(err.to_string()));
                }
            }
        }
    }
}

impl BrokerClient for BrokerHttpClient {
    fn post_data_request(
        &self,
        query: &QueryDocument,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        // Not retried: a lost response may still have created a job.
        let url = self.endpoint("datarequest");
        self.send_once(Self::authorized(self.client.post(&url), credential).json(query))
    }

    fn fetch_status(
        &self,
        job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        // The poller owns the retry budget for status checks.
        let url = self.endpoint(&format!("datarequest/status/{}", job.as_str()));
        self.send_once(Self::authorized(self.client.get(&url), credential))
    }

    fn fetch_result(
        &self,
        job: &JobHandle,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        let url = self.endpoint(&format!("datarequest/jobs/{}/result", job.as_str()));
        self.send_with_retries(|| Self::authorized(self.client.get(&url), credential))
    }

    fn post_order(
        &self,
        job: &JobHandle,
        uri: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        let url = self.endpoint("dataorder");
        let body = json!({ "jobId": job.as_str(), "uri": uri });
        self.send_once(Self::authorized(self.client.post(&url), credential).json(&body))
    }
}

impl CatalogClient for BrokerHttpClient {
    fn list_datasets(&self, size: usize) -> Result<BrokerReply, WekeoError> {
        let url = self.endpoint("datasets");
        self.send_with_retries(|| self.client.get(&url).query(&[("size", size)]))
    }

    fn query_metadata(
        &self,
        dataset_id: &str,
        credential: &Credential,
    ) -> Result<BrokerReply, WekeoError> {
        let url = self.endpoint(&format!("querymetadata/{dataset_id}"));
        self.send_with_retries(|| Self::authorized(self.client.get(&url), credential))
    }
}

impl ContentFetcher for BrokerHttpClient {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, WekeoError> {
        let response = self.send_download(url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "download request failed".to_string());
            return Err(WekeoError::BrokerStatus { status, message });
        }
        Ok(Box::new(response))
    }
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_paths() {
        let client =
            BrokerHttpClient::new("http://localhost:9/databroker/", Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.base_url(), "http://localhost:9/databroker");
        assert_eq!(
            client.endpoint("/datarequest/status/abc"),
            "http://localhost:9/databroker/datarequest/status/abc"
        );
    }

    #[test]
    fn reply_auth_check() {
        let err = BrokerReply::new(401, "token expired").check_auth().unwrap_err();
        assert!(matches!(err, WekeoError::Auth { status: 401, .. }));
        assert!(BrokerReply::new(500, "").check_auth().is_ok());
    }
}
