//! Response buffers handed back by the host.

/// A string buffer allocated by the host and owned by the caller.
///
/// Implementations release the allocation in `Drop`, so a buffer is freed
/// exactly once on every path out of the call that received it, including
/// early returns and unwinding.
pub trait OwnedBuffer {
    /// Decode the buffer contents. Invalid sequences are replaced.
    fn to_string_lossy(&self) -> String;
}

/// Decode an optional buffer, consuming (and so releasing) it.
pub fn take_text<B: OwnedBuffer>(buffer: Option<B>) -> Option<String> {
    buffer.map(|b| b.to_string_lossy())
}
