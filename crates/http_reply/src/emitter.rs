use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

// -- Errors

#[derive(Debug)]
pub enum EmitError {
    Io { written: usize, source: io::Error },
    WriteZero { written: usize },
}

impl EmitError {
    #[must_use]
    pub fn written(&self) -> usize {
        match self {
            Self::Io { written, .. } | Self::WriteZero { written } => *written,
        }
    }
}

impl std::error::Error for EmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::WriteZero { .. } => None,
        }
    }
}

impl core::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { written, source } => {
                write!(f, "write failed after {written} bytes: {source}")
            }
            Self::WriteZero { written } => {
                write!(f, "socket stopped accepting bytes after {written} bytes")
            }
        }
    }
}

/// Writes `payload` exactly as given, looping over short writes until every
/// byte went out. Nothing is retried with different content.
pub async fn emit<W>(writer: &mut W, payload: &[u8]) -> Result<usize, EmitError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;

    while written < payload.len() {
        match writer.write(&payload[written..]).await {
            Ok(0) => return Err(EmitError::WriteZero { written }),
            Ok(count) => written += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(EmitError::Io { written, source }),
        }
    }

    writer
        .flush()
        .await
        .map_err(|source| EmitError::Io { written, source })?;

    Ok(written)
}
