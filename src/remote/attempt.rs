use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::job::CompileJob;
use crate::local::Preprocessor;
use crate::remote::assignment::Assignment;
use crate::remote::chunk::ChunkBuffer;
use crate::remote::environment::provision;
use crate::remote::result::{materialize, OutputRelay};
use crate::remote::source::{stream_source, SourceOutcome};
use crate::transport::MsgChannel;

/// Read-only settings every attempt of a run shares.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub environment_archive: Option<PathBuf>,
    pub preprocessor: Preprocessor,
    pub chunk_size: usize,
}

impl AttemptSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            environment_archive: config.environment.archive.clone(),
            preprocessor: config.toolchain.preprocessor(),
            chunk_size: config.chunk_size,
        }
    }
}

/// One end-to-end remote build of a single job copy.
///
/// Owns its worker connection; the connection is closed when the attempt is
/// consumed, whatever the outcome.
pub struct RemoteBuildAttempt<C> {
    job: CompileJob,
    assignment: Assignment,
    worker: C,
}

impl<C> RemoteBuildAttempt<C>
where
    C: MsgChannel,
{
    pub fn new(job: CompileJob, assignment: Assignment, worker: C) -> Self {
        Self {
            job,
            assignment,
            worker,
        }
    }

    /// Provision, stream, and materialize.
    ///
    /// Returns the worker's status, or the preprocessor's own exit code when
    /// local preprocessing failed. Stage failures are returned untouched.
    pub async fn run(mut self, settings: &AttemptSettings, relay: Option<&dyn OutputRelay>) -> Result<i32> {
        let mut buffer = ChunkBuffer::new(settings.chunk_size);
        tracing::debug!(
            job_id = self.assignment.job_id,
            host = %self.assignment.hostname,
            has_environment = self.assignment.has_environment,
            "Starting remote attempt"
        );

        if !self.assignment.has_environment {
            provision(
                &mut self.worker,
                &self.assignment.environment,
                settings.environment_archive.as_deref(),
                &mut buffer,
            )
            .await?;
        }

        match stream_source(&mut self.worker, &self.job, &settings.preprocessor, &mut buffer).await? {
            SourceOutcome::PreprocessorFailed(status) => return Ok(status),
            SourceOutcome::Streamed { .. } => {}
        }

        materialize(&mut self.worker, &self.job, relay).await
    }
}
