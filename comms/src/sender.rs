//! The sending end of the framing protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize, frame_too_large};

/// The sending end handle of the communication.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    head: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    /// Creates a new `FrameSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            head: Vec::new(),
        }
    }

    /// Sends `msg` as one frame: the length prefix and whatever `msg` serialized into
    /// the head, then its borrowed body if any.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Errors
    /// An `InvalidInput` error if the frame exceeds `MAX_FRAME_LEN`, or any error of
    /// the underlying writer.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        self.head.clear();
        self.head.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let body = msg.serialize(&mut self.head).unwrap_or_default();
        let len = (self.head.len() - LEN_TYPE_SIZE + body.len()) as LenType;
        if len > MAX_FRAME_LEN {
            return Err(frame_too_large(io::ErrorKind::InvalidInput, len));
        }

        self.head[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());
        self.tx.write_all(&self.head).await?;

        if !body.is_empty() {
            self.tx.write_all(body).await?;
        }

        self.tx.flush().await
    }
}
