use std::path::Path;

use tokio::fs::File;

use crate::error::{BuildError, Result};
use crate::protocol::Message;
use crate::remote::chunk::{send_stream, ChunkBuffer, ChunkError};
use crate::transport::MsgChannel;

/// Stream the environment archive to a worker that does not have it cached.
///
/// The worker discards a transfer that never reaches its end marker, so any
/// failure here leaves nothing half-installed on its side.
pub async fn provision<C>(
    worker: &mut C,
    environment: &str,
    archive: Option<&Path>,
    buffer: &mut ChunkBuffer,
) -> Result<u64>
where
    C: MsgChannel + ?Sized,
{
    let archive = archive.ok_or_else(|| {
        BuildError::EnvironmentUnavailable(
            "worker needs an environment but no archive is configured".to_string(),
        )
    })?;

    let unavailable = |e: std::io::Error| {
        tracing::error!(
            archive = %archive.display(),
            error = %e,
            "Environment archive has to point to an existing file to be installed"
        );
        BuildError::EnvironmentUnavailable(format!("{}: {e}", archive.display()))
    };

    let mut file = File::open(archive).await.map_err(unavailable)?;
    let metadata = file.metadata().await.map_err(unavailable)?;
    if !metadata.is_file() {
        return Err(unavailable(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    tracing::info!(
        environment,
        archive = %archive.display(),
        size = metadata.len(),
        "Transferring environment"
    );

    worker
        .send(&Message::EnvironmentTransfer {
            environment: environment.to_string(),
        })
        .await
        .map_err(|e| BuildError::transport("environment transfer", e))?;

    match send_stream(buffer, &mut file, worker).await {
        Ok(sent) => Ok(sent),
        Err(ChunkError::Read(e)) => Err(unavailable(e)),
        Err(ChunkError::Transport(e)) => Err(BuildError::transport("environment transfer", e)),
        Err(other) => Err(BuildError::ProtocolViolation(other.to_string())),
    }
}
