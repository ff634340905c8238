//! Length-prefixed frames, the envelope of every request and response.
//!
//! # References
//! - <https://kafka.apache.org/protocol#protocol_common>

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReadError {
    #[error("Cannot read data: {0}")]
    IO(#[from] std::io::Error),

    #[error("Negative message size: {size}")]
    NegativeMessageSize { size: i32 },

    #[error("Message too large, limit is {limit} bytes but got {actual} bytes")]
    MessageTooLarge { limit: usize, actual: usize },
}

#[async_trait]
pub trait AsyncMessageRead {
    async fn read_message(&mut self, max_message_size: usize) -> Result<Vec<u8>, ReadError>;
}

#[async_trait]
impl<R> AsyncMessageRead for R
where
    R: AsyncRead + Send + Unpin,
{
    async fn read_message(&mut self, max_message_size: usize) -> Result<Vec<u8>, ReadError> {
        let size = self.read_i32().await?;
        let size = usize::try_from(size).map_err(|_| ReadError::NegativeMessageSize { size })?;

        if size > max_message_size {
            return Err(ReadError::MessageTooLarge {
                limit: max_message_size,
                actual: size,
            });
        }

        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WriteError {
    #[error("Cannot write data: {0}")]
    IO(#[from] std::io::Error),

    #[error("Message too large: {size}")]
    TooLarge { size: usize },
}

#[async_trait]
pub trait AsyncMessageWrite {
    async fn write_message(&mut self, msg: &[u8]) -> Result<(), WriteError>;
}

#[async_trait]
impl<W> AsyncMessageWrite for W
where
    W: AsyncWrite + Send + Unpin,
{
    async fn write_message(&mut self, msg: &[u8]) -> Result<(), WriteError> {
        let size = i32::try_from(msg.len()).map_err(|_| WriteError::TooLarge { size: msg.len() })?;

        // one buffer, so a frame never hits the wire half-written by a concurrent writer
        let mut buf = Vec::with_capacity(msg.len() + 4);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(msg);

        self.write_all(&buf).await?;
        self.flush().await?;
        Ok(())
    }
}
