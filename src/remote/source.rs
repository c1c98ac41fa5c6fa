use crate::error::{BuildError, ProtocolError, Result};
use crate::job::CompileJob;
use crate::local::{exit_code, Preprocessor, EXIT_LOCAL_SPAWN_FAILED};
use crate::protocol::{JobDescriptor, Message};
use crate::remote::chunk::{ChunkBuffer, ChunkError};
use crate::transport::MsgChannel;

/// How the source stage ended when it did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOutcome {
    /// Source fully relayed and terminated with the end marker.
    Streamed { bytes: u64 },
    /// Preprocessor exited non-zero; the worker is asked for nothing further.
    PreprocessorFailed(i32),
}

/// Build the job descriptor sent ahead of the source.
pub fn job_descriptor(job: &CompileJob) -> Result<JobDescriptor> {
    let job_id = job.job_id().ok_or_else(|| {
        BuildError::ProtocolViolation("job has no scheduler assignment".to_string())
    })?;
    Ok(JobDescriptor {
        job_id,
        environment: job.environment_version().to_string(),
        language: job.language,
        input_name: job.input_file.to_string_lossy().into_owned(),
        flags: job.remote_flags.clone(),
    })
}

/// Send the job descriptor, then relay the preprocessor's stdout to the worker
/// chunk by chunk while it is still running.
///
/// The end marker is only sent once the preprocessor has exited successfully,
/// so a worker never sees a complete stream for a failed preprocessing run.
pub async fn stream_source<C>(
    worker: &mut C,
    job: &CompileJob,
    preprocessor: &Preprocessor,
    buffer: &mut ChunkBuffer,
) -> Result<SourceOutcome>
where
    C: MsgChannel + ?Sized,
{
    let descriptor = job_descriptor(job)?;
    worker
        .send(&Message::CompileJob(descriptor))
        .await
        .map_err(|e| {
            tracing::info!(error = %e, "Write of job failed");
            BuildError::transport("job descriptor", e)
        })?;

    let mut child = match preprocessor.spawn(job) {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(program = preprocessor.program(), error = %e, "Preprocessor failed to start");
            return Ok(SourceOutcome::PreprocessorFailed(EXIT_LOCAL_SPAWN_FAILED));
        }
    };
    let Some(mut stdout) = child.stdout.take() else {
        let _ = child.start_kill();
        return Err(BuildError::transport(
            "source",
            ProtocolError::Io(std::io::Error::other("preprocessor stdout not captured")),
        ));
    };

    let relayed = buffer.send_from(&mut stdout, worker).await;
    drop(stdout);

    let bytes = match relayed {
        Ok(bytes) => bytes,
        Err(err) => {
            // Best effort; the child is also killed when dropped
            let _ = child.start_kill();
            let source = match err {
                ChunkError::Transport(e) => e,
                ChunkError::Read(e) | ChunkError::Write(e) => ProtocolError::Io(e),
                other @ ChunkError::Unexpected(_) => {
                    ProtocolError::Io(std::io::Error::other(other.to_string()))
                }
            };
            return Err(BuildError::transport("source", source));
        }
    };

    let status = match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            tracing::warn!(error = %e, "Waiting for preprocessor failed");
            255
        }
    };
    if status != 0 {
        tracing::info!(
            job_id = ?job.job_id(),
            status,
            bytes,
            "Preprocessor failed, abandoning remote job"
        );
        return Ok(SourceOutcome::PreprocessorFailed(status));
    }

    worker.send(&Message::End).await.map_err(|e| {
        tracing::info!(error = %e, "Write of end failed");
        BuildError::transport("source end", e)
    })?;

    tracing::debug!(job_id = ?job.job_id(), bytes, "Source streamed");
    Ok(SourceOutcome::Streamed { bytes })
}
