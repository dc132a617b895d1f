use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::info;

use crate::broker::{BrokerClient, ContentFetcher};
use crate::cancel::CancellationToken;
use crate::domain::{Credential, JobHandle, MaterializeMode, ResultManifest, TerminalStatus};
use crate::error::WekeoError;
use crate::materialize::{MaterializedDataset, Materializer};
use crate::order::DataOrderer;
use crate::poller::{JobPoller, PollOutcome, PollPolicy};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::query::QueryDocument;
use crate::resolve::ResultResolver;
use crate::submit::JobSubmitter;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: MaterializeMode,
    /// Place a data order before downloading.
    pub order: bool,
}

#[derive(Debug)]
pub struct RunResult {
    pub job: JobHandle,
    pub outcome: PollOutcome,
    pub manifest: Option<ResultManifest>,
    pub order_id: Option<String>,
    pub materialized: Option<MaterializedDataset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_id: String,
    pub status: TerminalStatus,
    pub status_checks: u32,
    pub url: Option<String>,
    pub filename: Option<String>,
    pub order_id: Option<String>,
    pub location: Option<String>,
    pub dimensions: Vec<String>,
    pub variables: Vec<String>,
}

impl RunResult {
    pub fn summary(&self) -> RunSummary {
        let entry = self.manifest.as_ref().map(|manifest| manifest.primary());
        let dataset = self.materialized.as_ref().and_then(|m| m.dataset());
        RunSummary {
            job_id: self.job.to_string(),
            status: self.outcome.status,
            status_checks: self.outcome.fetches,
            url: entry.map(|entry| entry.url.clone()),
            filename: entry.map(|entry| entry.filename.clone()),
            order_id: self.order_id.clone(),
            location: self
                .materialized
                .as_ref()
                .and_then(|m| m.location())
                .map(|path| path.to_string()),
            dimensions: dataset
                .map(|d| d.dimension_names().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            variables: dataset
                .map(|d| d.variable_names().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// Runs the job lifecycle stages against one broker.
pub struct App<C: BrokerClient + ContentFetcher> {
    client: C,
    policy: PollPolicy,
    output_dir: Utf8PathBuf,
}

impl<C: BrokerClient + ContentFetcher> App<C> {
    pub fn new(client: C, policy: PollPolicy, output_dir: Utf8PathBuf) -> Self {
        Self {
            client,
            policy,
            output_dir,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn submit(
        &self,
        query: &QueryDocument,
        credential: &Credential,
        sink: &dyn ProgressSink,
    ) -> Result<JobHandle, WekeoError> {
        let job = JobSubmitter::new(&self.client).submit(query, credential)?;
        sink.event(ProgressEvent::Submitted { job: job.clone() });
        Ok(job)
    }

    pub fn wait(
        &self,
        job: &JobHandle,
        credential: &Credential,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<PollOutcome, WekeoError> {
        JobPoller::new(&self.client, self.policy).poll(job, credential, cancel, sink)
    }

    pub fn resolve(
        &self,
        job: &JobHandle,
        credential: &Credential,
        sink: &dyn ProgressSink,
    ) -> Result<ResultManifest, WekeoError> {
        let manifest = ResultResolver::new(&self.client).resolve(job, credential)?;
        let entry = manifest.primary();
        sink.event(ProgressEvent::Resolved {
            job: job.clone(),
            url: entry.url.clone(),
            filename: entry.filename.clone(),
        });
        Ok(manifest)
    }

    pub fn order(
        &self,
        job: &JobHandle,
        manifest: &ResultManifest,
        credential: &Credential,
    ) -> Result<String, WekeoError> {
        DataOrderer::new(&self.client).order(job, manifest, credential)
    }

    pub fn materialize(
        &self,
        manifest: &ResultManifest,
        mode: MaterializeMode,
        sink: &dyn ProgressSink,
    ) -> Result<MaterializedDataset, WekeoError> {
        let materialized = Materializer::with_output_dir(&self.client, self.output_dir.clone())
            .materialize(manifest, mode)?;
        sink.event(ProgressEvent::Materialized {
            mode,
            location: materialized.location().map(|path| path.to_string()),
        });
        Ok(materialized)
    }

    /// Polls an existing job and, once completed, resolves and materializes
    /// its result. Any other terminal status stops the run early.
    pub fn complete(
        &self,
        job: JobHandle,
        credential: &Credential,
        options: &RunOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, WekeoError> {
        let outcome = self.wait(&job, credential, cancel, sink)?;
        if !outcome.status.is_success() {
            info!(job = %job, status = %outcome.status, "job did not complete");
            return Ok(RunResult {
                job,
                outcome,
                manifest: None,
                order_id: None,
                materialized: None,
            });
        }

        let manifest = self.resolve(&job, credential, sink)?;
        let order_id = if options.order {
            Some(self.order(&job, &manifest, credential)?)
        } else {
            None
        };
        let materialized = self.materialize(&manifest, options.mode, sink)?;
        Ok(RunResult {
            job,
            outcome,
            manifest: Some(manifest),
            order_id,
            materialized: Some(materialized),
        })
    }

    /// Full lifecycle: submit, poll, resolve, materialize.
    pub fn run(
        &self,
        query: &QueryDocument,
        credential: &Credential,
        options: &RunOptions,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> Result<RunResult, WekeoError> {
        let job = self.submit(query, credential, sink)?;
        self.complete(job, credential, options, cancel, sink)
    }
}
