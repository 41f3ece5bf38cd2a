//! Transport layer for secure channels.
//!
//! A channel runs over any duplex byte stream. TCP is provided here; relayed
//! or in-memory streams work the same way as long as they implement
//! tokio's `AsyncRead + AsyncWrite`.

mod tcp;

pub use tcp::{TcpListener, TcpTransport};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::error::ChannelError;

/// Upper bound for a single length-prefixed handshake frame.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Bidirectional byte stream a channel can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Box any stream as a transport.
pub fn boxed<T: Transport>(stream: T) -> BoxedTransport {
    Box::new(stream)
}

/// Helper to write a length-prefixed frame asynchronously.
pub async fn write_length_prefixed<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ChannelError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper to read a length-prefixed frame asynchronously.
pub async fn read_length_prefixed<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> Result<Vec<u8>, ChannelError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(ChannelError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_prefixed_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_length_prefixed(&mut a, b"hello").await.unwrap();
        write_length_prefixed(&mut a, b"").await.unwrap();

        assert_eq!(read_length_prefixed(&mut b).await.unwrap(), b"hello");
        assert!(read_length_prefixed(&mut b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_length_prefixed(&mut b).await,
            Err(ChannelError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_boxed_duplex_is_a_transport() {
        let (a, b) = tokio::io::duplex(64);
        let mut a = boxed(a);
        let mut b = boxed(b);

        write_length_prefixed(&mut a, b"boxed").await.unwrap();
        assert_eq!(read_length_prefixed(&mut b).await.unwrap(), b"boxed");
    }
}
