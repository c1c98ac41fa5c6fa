use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ClientConfig;
use crate::error::{BuildError, Result, EXIT_DISTCC_FAILED};
use crate::job::CompileJob;
use crate::local::LocalCompiler;
use crate::path::absolute_path;
use crate::protocol::MIN_REDUNDANCY_PROTOCOL;
use crate::remote::assignment::{negotiate, request_assignment, Assignment};
use crate::remote::attempt::{AttemptSettings, RemoteBuildAttempt};
use crate::remote::result::{OutputRelay, StdStreams};
use crate::transport::{MsgChannel, WorkerConnection};

/// Bookkeeping for one redundant copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// 0 is the primary copy.
    pub index: usize,
    pub job_id: Option<u32>,
    /// Id of the task that ran this copy; `None` when it ran inline.
    pub task_id: Option<String>,
    pub worker: String,
    pub output: PathBuf,
    /// `None` when the copy's task could not be joined.
    pub status: Option<i32>,
    /// Error kind that sent this copy to a local build, if any.
    pub fallback: Option<String>,
}

/// Outcome of a whole run: the primary's status plus every copy's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub status: i32,
    pub copies: Vec<AttemptRecord>,
}

/// Entry point for remote builds.
///
/// With one copy the attempt runs inline and its failure is returned to the
/// caller. With more, every copy runs as its own task and a failing copy falls
/// back to a local build; only copy 0 writes the real output or relays output.
pub struct RedundancyCoordinator {
    settings: Arc<AttemptSettings>,
    environment: String,
    redundancy: u32,
    local: Arc<dyn LocalCompiler>,
    relay: Arc<dyn OutputRelay>,
}

impl RedundancyCoordinator {
    pub fn new(config: &ClientConfig, local: Arc<dyn LocalCompiler>) -> Self {
        Self {
            settings: Arc::new(AttemptSettings::from_config(config)),
            environment: config.environment.version.clone(),
            redundancy: config.redundancy.max(1),
            local,
            relay: Arc::new(StdStreams),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn OutputRelay>) -> Self {
        self.relay = relay;
        self
    }

    /// Build `job` remotely over an established scheduler connection.
    ///
    /// The scheduler's protocol version is only known once its first reply
    /// has arrived, so a multi-copy run negotiates the primary before deciding
    /// whether the scheduler can serve the other copies at all.
    pub async fn build_remote<C>(&self, scheduler: &mut C, mut job: CompileJob) -> Result<BuildReport>
    where
        C: MsgChannel + ?Sized,
    {
        match absolute_path(&job.input_file) {
            Ok(abs) => job.input_file = abs,
            Err(e) => tracing::warn!(
                input = %job.input_file.display(),
                error = %e,
                "Could not make input path absolute"
            ),
        }

        let copies = self.redundancy;
        request_assignment(scheduler, &job, &self.environment, copies).await?;
        if copies == 1 {
            return self.build_single(scheduler, job).await;
        }

        let mut primary = job.clone();
        let (assignment, worker) = negotiate(scheduler, &mut primary).await?;

        let protocol = scheduler.protocol_version();
        if protocol < MIN_REDUNDANCY_PROTOCOL {
            tracing::info!(protocol, copies, "Scheduler too old for redundant builds, using one copy");
            return self.run_single(primary, assignment, worker).await;
        }

        self.build_redundant(scheduler, job, (primary, assignment, worker), copies as usize)
            .await
    }

    async fn build_single<C>(&self, scheduler: &mut C, mut job: CompileJob) -> Result<BuildReport>
    where
        C: MsgChannel + ?Sized,
    {
        let (assignment, worker) = negotiate(scheduler, &mut job).await?;
        self.run_single(job, assignment, worker).await
    }

    async fn run_single(
        &self,
        job: CompileJob,
        assignment: Assignment,
        worker: WorkerConnection,
    ) -> Result<BuildReport> {
        let mut record = record_for(0, &job, &assignment);

        let status = RemoteBuildAttempt::new(job, assignment, worker)
            .run(&self.settings, Some(self.relay.as_ref()))
            .await?;

        record.status = Some(status);
        Ok(BuildReport {
            status,
            copies: vec![record],
        })
    }

    async fn build_redundant<C>(
        &self,
        scheduler: &mut C,
        job: CompileJob,
        primary: (CompileJob, Assignment, WorkerConnection),
        copies: usize,
    ) -> Result<BuildReport>
    where
        C: MsgChannel + ?Sized,
    {
        // Non-primary copies write here; removed once the run is aggregated
        let private_dir = tempfile::Builder::new()
            .prefix("fleetcc-copies-")
            .tempdir()
            .map_err(|source| BuildError::OutputWriteFailed {
                path: std::env::temp_dir().display().to_string(),
                source,
            })?;

        // Every copy gets its worker before any of them starts
        let mut negotiated = Vec::with_capacity(copies);
        negotiated.push(primary);
        for index in 1..copies {
            let mut copy = job.copy_for(index, private_dir.path());
            let (assignment, worker) = negotiate(scheduler, &mut copy).await?;
            negotiated.push((copy, assignment, worker));
        }

        let mut units = Vec::with_capacity(copies);
        for (index, (copy, assignment, worker)) in negotiated.into_iter().enumerate() {
            let mut record = record_for(index, &copy, &assignment);
            let settings = self.settings.clone();
            let local = self.local.clone();
            let relay = (index == 0).then(|| self.relay.clone());
            let handle = tokio::spawn(run_unit(copy, assignment, worker, settings, local, relay));
            record.task_id = Some(handle.id().to_string());
            units.push((record, handle));
        }

        let mut records = Vec::with_capacity(copies);
        for (mut record, handle) in units {
            match handle.await {
                Ok(outcome) => {
                    record.status = Some(outcome.status);
                    record.fallback = outcome.fallback;
                }
                Err(e) => {
                    tracing::error!(copy = record.index, error = %e, "Redundant copy did not finish");
                }
            }
            tracing::info!(
                copy = record.index,
                task = record.task_id.as_deref().unwrap_or("-"),
                output = %record.output.display(),
                status = ?record.status,
                fallback = ?record.fallback,
                "File compiled"
            );
            records.push(record);
        }

        let status = records
            .first()
            .and_then(|r| r.status)
            .unwrap_or(EXIT_DISTCC_FAILED);
        drop(private_dir);

        Ok(BuildReport {
            status,
            copies: records,
        })
    }
}

struct UnitOutcome {
    status: i32,
    fallback: Option<String>,
}

/// One concurrent copy: the remote attempt, replaced by a local build if it fails.
async fn run_unit(
    job: CompileJob,
    assignment: Assignment,
    worker: WorkerConnection,
    settings: Arc<AttemptSettings>,
    local: Arc<dyn LocalCompiler>,
    relay: Option<Arc<dyn OutputRelay>>,
) -> UnitOutcome {
    let fallback_job = job.clone();
    let attempt = RemoteBuildAttempt::new(job, assignment, worker);

    match attempt.run(&settings, relay.as_deref()).await {
        Ok(status) => UnitOutcome {
            status,
            fallback: None,
        },
        Err(e) => {
            tracing::warn!(
                job_id = ?fallback_job.job_id(),
                error = %e,
                kind = e.kind(),
                "Remote attempt failed, compiling locally"
            );
            UnitOutcome {
                status: local.compile(&fallback_job, relay.as_deref()).await,
                fallback: Some(e.kind().to_string()),
            }
        }
    }
}

fn record_for(index: usize, job: &CompileJob, assignment: &Assignment) -> AttemptRecord {
    AttemptRecord {
        index,
        job_id: job.job_id(),
        task_id: None,
        worker: format!("{}:{}", assignment.hostname, assignment.port),
        output: job.output_file.clone(),
        status: None,
        fallback: None,
    }
}
