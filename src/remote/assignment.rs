use crate::error::{BuildError, Result};
use crate::job::CompileJob;
use crate::protocol::Message;
use crate::transport::{connect_tcp, MsgChannel, WorkerConnection};

/// The scheduler's answer for one job copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub hostname: String,
    pub port: u16,
    pub job_id: u32,
    pub environment: String,
    /// Worker already has the environment cached.
    pub has_environment: bool,
}

impl Assignment {
    /// Open a connection to the assigned worker.
    pub async fn connect(&self) -> Result<WorkerConnection> {
        connect_tcp(&self.hostname, self.port).await.map_err(|source| {
            tracing::warn!(
                host = %self.hostname,
                port = self.port,
                error = %source,
                "No server found behind given hostname"
            );
            BuildError::WorkerUnreachable {
                host: self.hostname.clone(),
                port: self.port,
                source,
            }
        })
    }
}

/// Ask the scheduler for `copies` workers able to compile `job`.
///
/// `job.input_file` must already be absolute.
pub async fn request_assignment<C>(
    scheduler: &mut C,
    job: &CompileJob,
    environment: &str,
    copies: u32,
) -> Result<()>
where
    C: MsgChannel + ?Sized,
{
    let request = Message::RequestAssignment {
        environment: environment.to_string(),
        input_path: job.input_file.to_string_lossy().into_owned(),
        language: job.language,
        copies,
    };
    scheduler.send(&request).await.map_err(|e| {
        tracing::error!(error = %e, "Asking scheduler for a compile server failed");
        BuildError::transport("assignment request", e)
    })
}

/// Read one assignment reply and record it on `job`.
pub async fn await_assignment<C>(scheduler: &mut C, job: &mut CompileJob) -> Result<Assignment>
where
    C: MsgChannel + ?Sized,
{
    let reply = match scheduler.receive().await {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            return Err(BuildError::ProtocolViolation(
                "scheduler closed the connection instead of assigning a worker".to_string(),
            ))
        }
        Err(e) => {
            return Err(BuildError::ProtocolViolation(format!(
                "no assignment reply from scheduler: {e}"
            )))
        }
    };

    let kind = reply.kind();
    let Message::AssignmentReply {
        hostname,
        port,
        job_id,
        environment,
        has_environment,
    } = reply
    else {
        tracing::error!(kind = kind.name(), "Scheduler did not reply with an assignment");
        return Err(BuildError::ProtocolViolation(format!(
            "expected assignment reply, got {}",
            kind.name()
        )));
    };

    // The scheduler knows which environment the worker will use
    job.assign(job_id, environment.clone());
    tracing::debug!(host = %hostname, port, job_id, "Have to use host");

    Ok(Assignment {
        hostname,
        port,
        job_id,
        environment,
        has_environment,
    })
}

/// Read the next assignment and connect to its worker.
pub async fn negotiate<C>(scheduler: &mut C, job: &mut CompileJob) -> Result<(Assignment, WorkerConnection)>
where
    C: MsgChannel + ?Sized,
{
    let assignment = await_assignment(scheduler, job).await?;
    let connection = assignment.connect().await?;
    Ok((assignment, connection))
}
