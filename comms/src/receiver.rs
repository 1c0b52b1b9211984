//! The implementation of the receiving end of the application layer protocol.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align4, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, frame_too_large};

const STARTING_RX_BUF_SIZE: usize = 1024;

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u32>,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::with_capacity(STARTING_RX_BUF_SIZE),
        }
    }

    /// Waits to receive a new message, deserializing it out of the receiver's own buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure. The
    /// returned value borrows the receiver until it is dropped.
    pub async fn recv<'buf, T>(&'buf mut self) -> io::Result<T>
    where
        T: Deserialize<'buf>,
    {
        let Self { rx, buf } = self;
        Self::read_frame(rx, buf).await
    }

    /// Waits to receive a new message from the inner receiver.
    ///
    /// # Arguments
    /// * `buf` - The buffer to use for deserialization, the returned
    ///   `T`'s lifetimes will be tied to this buffer.
    ///
    /// # Returns
    /// A result object that returns `T` on success or `io::Error` on failure.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        Self::read_frame(&mut self.rx, buf).await
    }

    async fn read_frame<'buf, T, B>(rx: &mut R, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align4,
    {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf);
        if len > MAX_FRAME_LEN {
            return Err(frame_too_large(io::ErrorKind::InvalidData, len));
        }

        let len = len as usize;

        let needed_amount = len.div_ceil(size_of::<B>());
        buf.clear();
        buf.resize(needed_amount, B::zeroed());

        let view = bytemuck::cast_slice_mut(buf.as_mut_slice());
        let slice = &mut view[..len];
        rx.read_exact(slice).await?;

        T::deserialize(slice)
    }
}
