//! Core traits for the notification socket.

/// Message parser trait for converting raw frame bytes to messages.
///
/// May return an empty vec when a well-formed frame carries nothing of interest, or several
/// messages when one frame fans out. An `Err` marks the frame as malformed; callers drop it.
///
/// # Example
///
/// ```ignore
/// pub struct SimpleParser;
///
/// impl MessageParser<MyMessage> for SimpleParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<MyMessage>> {
///         let msg: MyMessage = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}
