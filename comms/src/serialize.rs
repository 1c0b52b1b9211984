/// Writes a message into a frame.
///
/// Implementors may write a small header into `buf` and hand back a borrowed
/// slice that is written right after it, avoiding a copy of large payloads.
pub trait Serialize<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]>;
}
