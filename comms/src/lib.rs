mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::Align4;
pub use deserialize::Deserialize;
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// The largest frame body either end accepts, in bytes: one tensor of 64 Mi `f32`
/// values plus its header.
pub const MAX_FRAME_LEN: u64 = (1 << 28) + 64;

fn frame_too_large(kind: io::ErrorKind, len: LenType) -> io::Error {
    io::Error::new(
        kind,
        format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
    )
}

/// Creates both `FrameReceiver` and `FrameSender` network channel parts.
///
/// Given a reader and a writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
