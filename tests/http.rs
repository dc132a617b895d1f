mod common;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use common::sea_bottom_netcdf;
use wekeo_broker::app::{App, RunOptions};
use wekeo_broker::auth::{BrokerLogin, TokenProvider};
use wekeo_broker::broker::{BrokerClient, BrokerHttpClient, ContentFetcher};
use wekeo_broker::cancel::CancellationToken;
use wekeo_broker::domain::{Credential, JobHandle, MaterializeMode, TerminalStatus};
use wekeo_broker::error::WekeoError;
use wekeo_broker::poller::{Backoff, PollPolicy};
use wekeo_broker::progress::NoopSink;
use wekeo_broker::query::QueryDocument;
use wekeo_broker::submit::JobSubmitter;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

/// Serves one scripted `(status, body)` per connection, in order.
struct FakeServer {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    fn start(replies: Vec<(u16, Vec<u8>)>) -> Self {
        Self::start_with(|_| replies)
    }

    /// `replies` receives the base URL so bodies can point back at the server.
    fn start_with<F>(replies: F) -> Self
    where
        F: FnOnce(&str) -> Vec<(u16, Vec<u8>)>,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/databroker", listener.local_addr().unwrap());
        let replies = replies(&base_url);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);

        let handle = thread::spawn(move || {
            for (status, body) in replies {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());

                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut headers = HashMap::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':') {
                        headers.insert(name.trim().to_lowercase(), value.trim().to_string());
                    }
                }
                let length = headers
                    .get("content-length")
                    .and_then(|value| value.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut request_body = vec![0u8; length];
                reader.read_exact(&mut request_body).unwrap();

                recorded.lock().unwrap().push(Recorded {
                    method,
                    path,
                    headers,
                    body: String::from_utf8_lossy(&request_body).into_owned(),
                });

                let head = format!(
                    "HTTP/1.1 {status} Scripted\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
                stream.flush().unwrap();
            }
        });

        Self {
            base_url,
            requests,
            handle,
        }
    }

    fn client(&self) -> BrokerHttpClient {
        BrokerHttpClient::new(&self.base_url, Duration::from_secs(5)).unwrap()
    }

    fn finish(self) -> Vec<Recorded> {
        self.handle.join().unwrap();
        Arc::try_unwrap(self.requests)
            .unwrap()
            .into_inner()
            .unwrap()
    }
}

fn json_reply(status: u16, body: &str) -> (u16, Vec<u8>) {
    (status, body.as_bytes().to_vec())
}

#[test]
fn submit_posts_query_with_authorization() {
    let server = FakeServer::start(vec![json_reply(200, r#"{"jobId":"remote-1"}"#)]);
    let client = server.client();

    let job = JobSubmitter::new(&client)
        .submit(&QueryDocument::new("EO:EEA:DAT:CORINE"), &Credential::new("tok"))
        .unwrap();
    let requests = server.finish();

    assert_eq!(job.as_str(), "remote-1");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/databroker/datarequest");
    assert_eq!(requests[0].headers["authorization"], "Basic tok");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["datasetId"], "EO:EEA:DAT:CORINE");
}

#[test]
fn rejected_submission_carries_the_body() {
    let server = FakeServer::start(vec![json_reply(400, "Dataset EO:X is unknown")]);
    let client = server.client();

    let result = JobSubmitter::new(&client)
        .submit(&QueryDocument::new("EO:X"), &Credential::new("tok"));
    server.finish();

    assert_matches!(
        result,
        Err(WekeoError::Submission { status: 400, message }) if message == "Dataset EO:X is unknown"
    );
}

#[test]
fn status_request_targets_the_job() {
    let server = FakeServer::start(vec![json_reply(200, r#"{"status":"running"}"#)]);
    let client = server.client();
    let job: JobHandle = "abc-123".parse().unwrap();

    let reply = client.fetch_status(&job, &Credential::new("tok")).unwrap();
    let requests = server.finish();

    assert_eq!(reply.status, 200);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/databroker/datarequest/status/abc-123");
}

#[test]
fn login_exchanges_basic_credentials_for_a_token() {
    let server = FakeServer::start(vec![json_reply(200, r#"{"access_token":"fresh"}"#)]);
    let client = server.client();

    let credential = BrokerLogin::new(&client, "user", "pass").credential().unwrap();
    let requests = server.finish();

    assert_eq!(credential.header_value(), "Basic fresh");
    assert_eq!(requests[0].path, "/databroker/gettoken");
    assert_eq!(requests[0].headers["authorization"], "Basic dXNlcjpwYXNz");
}

#[test]
fn download_errors_keep_the_status() {
    let server = FakeServer::start(vec![json_reply(404, "gone")]);
    let client = server.client();
    let url = format!("{}/download/x.nc", server.base_url);

    let result = client.open(&url);
    server.finish();

    assert_matches!(
        result.map(|_| ()),
        Err(WekeoError::BrokerStatus { status: 404, message }) if message == "gone"
    );
}

#[test]
fn full_lifecycle_over_http() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let bytes = sea_bottom_netcdf();
    let server = FakeServer::start_with(|base_url| {
        vec![
            json_reply(200, r#"{"jobId":"life-1"}"#),
            json_reply(200, r#"{"status":"running"}"#),
            json_reply(200, r#"{"status":"completed"}"#),
            json_reply(
                200,
                &format!(r#"{{"content":[{{"url":"{base_url}/files/x.nc","filename":"x.nc"}}]}}"#),
            ),
            (200, bytes.clone()),
        ]
    });
    let app = App::new(
        server.client(),
        PollPolicy {
            backoff: Backoff::Fixed(Duration::ZERO),
            ..PollPolicy::default()
        },
        dir.clone(),
    );
    let options = RunOptions {
        mode: MaterializeMode::ToFile,
        order: false,
    };

    let result = app
        .run(
            &QueryDocument::new("EO:MO:DAT:NWSHELF_ANALYSISFORECAST_PHY_LR_004_001"),
            &Credential::new("tok"),
            &options,
            &CancellationToken::new(),
            &NoopSink,
        )
        .unwrap();
    let requests = server.finish();

    assert_eq!(result.outcome.status, TerminalStatus::Completed);
    assert_eq!(std::fs::read(dir.join("x.nc")).unwrap(), bytes);
    let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/databroker/datarequest",
            "/databroker/datarequest/status/life-1",
            "/databroker/datarequest/status/life-1",
            "/databroker/datarequest/jobs/life-1/result",
            "/databroker/files/x.nc",
        ]
    );
    assert!(!requests[4].headers.contains_key("authorization"));
}
