use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::{BuildError, Result};
use crate::job::CompileJob;
use crate::protocol::Message;
use crate::remote::chunk::{receive_stream, ChunkError};
use crate::transport::MsgChannel;

/// Destination for the remote compiler's captured output.
pub trait OutputRelay: Send + Sync {
    fn relay(&self, stdout: &str, stderr: &str);
}

/// Writes captured compiler output verbatim to this process's stdout and stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdStreams;

impl OutputRelay for StdStreams {
    fn relay(&self, stdout: &str, stderr: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(stdout.as_bytes());
        let _ = out.flush();
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(stderr.as_bytes());
        let _ = err.flush();
    }
}

/// Read the compile result and, on success, install the object at `job.output_file`.
///
/// Returns the remote compiler's status. The output path is only ever touched
/// by an atomic rename of a fully written file.
pub async fn materialize<C>(
    worker: &mut C,
    job: &CompileJob,
    relay: Option<&dyn OutputRelay>,
) -> Result<i32>
where
    C: MsgChannel + ?Sized,
{
    let reply = worker
        .receive()
        .await
        .map_err(|e| BuildError::transport("compile result", e))?;

    let (status, stdout, stderr) = match reply {
        Some(Message::CompileResult {
            status,
            stdout,
            stderr,
        }) => (status, stdout, stderr),
        Some(other) => {
            return Err(BuildError::ProtocolViolation(format!(
                "expected compile result, got {}",
                other.kind().name()
            )))
        }
        None => {
            return Err(BuildError::ProtocolViolation(
                "worker closed the connection before sending a result".to_string(),
            ))
        }
    };

    if let Some(relay) = relay {
        relay.relay(&stdout, &stderr);
    }

    tracing::debug!(job_id = ?job.job_id(), status, "Remote compile finished");
    if status != 0 {
        return Ok(status);
    }

    let bytes = install_object(worker, &job.output_file).await?;
    tracing::debug!(output = %job.output_file.display(), bytes, "Object installed");
    Ok(status)
}

/// Receive the object chunk stream into a temporary file beside `output`,
/// then rename it into place.
///
/// The temporary file is removed on every failure path.
pub async fn install_object<C>(worker: &mut C, output: &Path) -> Result<u64>
where
    C: MsgChannel + ?Sized,
{
    let write_failed = |source: std::io::Error| BuildError::OutputWriteFailed {
        path: output.display().to_string(),
        source,
    };

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = format!(
        ".{}.",
        output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".fleettmp")
        .permissions(std::fs::Permissions::from_mode(0o666))
        .tempfile_in(dir)
        .map_err(write_failed)?;

    let mut file = tokio::fs::File::from_std(tmp.reopen().map_err(write_failed)?);
    let bytes = match receive_stream(worker, &mut file).await {
        Ok(bytes) => bytes,
        Err(ChunkError::Write(e)) | Err(ChunkError::Read(e)) => return Err(write_failed(e)),
        Err(ChunkError::Transport(e)) => return Err(BuildError::transport("object", e)),
        Err(ChunkError::Unexpected(kind)) => {
            return Err(BuildError::ProtocolViolation(format!(
                "expected file chunk or end while receiving object, got {}",
                kind.map_or("nothing", |k| k.name())
            )))
        }
    };

    file.flush().await.map_err(write_failed)?;
    file.sync_all().await.map_err(write_failed)?;
    drop(file);

    tmp.persist(output).map_err(|e| write_failed(e.error))?;
    Ok(bytes)
}
