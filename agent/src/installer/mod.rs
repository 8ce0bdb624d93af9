//! Artifact installer
//!
//! Streams an image of known total size into a partition block device.

use tokio::fs::OpenOptions;
use tokio::io::{self, AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use crate::errors::AgentError;

/// Copy `image` into the block device at `dest` until EOF. Writes are not
/// synced between chunks; a single final flush makes the image durable
/// before returning.
pub async fn install_image<R>(image: &mut R, size: i64, dest: &str) -> Result<(), AgentError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if size < 0 {
        return Err(AgentError::VerificationError(format!(
            "invalid update size: {}",
            size
        )));
    }

    let mut out = OpenOptions::new().write(true).open(dest).await?;

    let written = io::copy(image, &mut out).await?;
    out.flush().await?;
    out.sync_all().await?;

    debug!("wrote {} bytes to {}", written, dest);
    if size > 0 && written != size as u64 {
        warn!(
            "update size mismatch: expected {} bytes, wrote {}",
            size, written
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copies_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partition");
        tokio::fs::write(&dest, b"").await.unwrap();

        let image: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let mut reader = std::io::Cursor::new(image.clone());

        install_image(&mut reader, image.len() as i64, dest.to_str().unwrap())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&dest).await.unwrap(), image);
    }

    #[tokio::test]
    async fn test_negative_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("partition");
        tokio::fs::write(&dest, b"").await.unwrap();

        let mut reader = std::io::Cursor::new(vec![1u8, 2, 3]);
        let err = install_image(&mut reader, -1, dest.to_str().unwrap()).await;
        assert!(matches!(err, Err(AgentError::VerificationError(_))));
    }

    #[tokio::test]
    async fn test_missing_destination_is_io_error() {
        let mut reader = std::io::Cursor::new(vec![1u8]);
        let err = install_image(&mut reader, 1, "/nonexistent/device").await;
        assert!(matches!(err, Err(AgentError::IoError(_))));
    }
}
