//! Reassembles JSON commands from a fragmented text stream.
//!
//! Transport frames do not have to line up with commands: one frame may carry
//! half a command, or several commands back to back, or junk in front of a
//! command.  [`MessageFramer::process`] appends each chunk to a buffer and
//! yields at most one command per call; calling it again with an empty chunk
//! drains the next command still buffered.

use ros2web_types::BridgeError;
use serde_json::{Deserializer, Value};
use tracing::warn;

/// Upper bound on buffered, not yet parseable input.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct MessageFramer {
    buffer: String,
    max_bytes: usize,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl MessageFramer {
    /// A framer that fails once more than `max_bytes` are buffered.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buffer: String::new(),
            max_bytes,
        }
    }

    /// Append `chunk` and try to take one JSON value off the buffer.
    ///
    /// # Errors
    ///
    /// [`BridgeError::FrameOverflow`] once the buffer grows past the bound.
    /// The buffer is discarded; the connection should be dropped.
    pub fn process(&mut self, chunk: &str) -> Result<Option<Value>, BridgeError> {
        self.buffer.push_str(chunk);
        if self.buffer.len() > self.max_bytes {
            self.buffer.clear();
            return Err(BridgeError::FrameOverflow {
                limit: self.max_bytes,
            });
        }
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return Ok(None);
        }
        if let Ok(value) = serde_json::from_str::<Value>(&self.buffer) {
            self.buffer.clear();
            return Ok(Some(value));
        }
        Ok(self.recover())
    }

    /// Scan for the first complete object carrying an `op` field.
    ///
    /// Each `{` is tried as the start of an object.  A complete object with
    /// an `op` is consumed and returned; one without is skipped.  An object
    /// cut off by the end of the buffer stops the scan, keeping it for the
    /// next chunk.  A start that can never parse is skipped.
    fn recover(&mut self) -> Option<Value> {
        let mut from = 0;
        loop {
            let Some(offset) = self.buffer[from..].find('{') else {
                self.discard(self.buffer.len());
                return None;
            };
            let start = from + offset;
            let mut stream = Deserializer::from_str(&self.buffer[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    let end = start + stream.byte_offset();
                    if value.get("op").is_some() {
                        self.discard(start);
                        self.buffer.drain(..end - start);
                        return Some(value);
                    }
                    from = end;
                }
                Some(Err(e)) if e.is_eof() => {
                    self.discard(start);
                    return None;
                }
                Some(Err(_)) => from = start + 1,
                None => {
                    self.discard(self.buffer.len());
                    return None;
                }
            }
        }
    }

    fn discard(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        let junk = &self.buffer[..len];
        if !junk.trim().is_empty() {
            warn!(bytes = len, "discarding unparseable input");
        }
        self.buffer.drain(..len);
    }

    /// Input received but not yet consumed.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_command_in_one_chunk() {
        let mut framer = MessageFramer::default();
        let value = framer
            .process(r#"{"op":"unsubscribe","topic":"/a"}"#)
            .unwrap();
        assert_eq!(value, Some(json!({"op": "unsubscribe", "topic": "/a"})));
        assert!(framer.is_empty());
    }

    #[test]
    fn fragmented_command_is_reassembled() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.process(r#"{"op":"publish","#).unwrap(), None);
        assert_eq!(framer.buffered(), r#"{"op":"publish","#);

        let value = framer.process(r#""topic":"/x","msg":{}}"#).unwrap();
        assert_eq!(
            value,
            Some(json!({"op": "publish", "topic": "/x", "msg": {}}))
        );
        assert!(framer.is_empty());
    }

    #[test]
    fn concatenated_commands_are_split() {
        let mut framer = MessageFramer::default();
        let first = framer
            .process(r#"{"op":"set_level","level":"none"}{"op":"unsubscribe","topic":"/a"}"#)
            .unwrap();
        assert_eq!(first, Some(json!({"op": "set_level", "level": "none"})));
        assert_eq!(framer.buffered(), r#"{"op":"unsubscribe","topic":"/a"}"#);

        let second = framer.process("").unwrap();
        assert_eq!(second, Some(json!({"op": "unsubscribe", "topic": "/a"})));
        assert_eq!(framer.process("").unwrap(), None);
    }

    #[test]
    fn complete_command_followed_by_fragment() {
        let mut framer = MessageFramer::default();
        let first = framer
            .process(r#"{"op":"unadvertise","topic":"/a"}{"op":"adv"#)
            .unwrap();
        assert_eq!(first, Some(json!({"op": "unadvertise", "topic": "/a"})));
        assert_eq!(framer.process("").unwrap(), None);
        assert_eq!(framer.buffered(), r#"{"op":"adv"#);
    }

    #[test]
    fn leading_junk_is_skipped() {
        let mut framer = MessageFramer::default();
        let value = framer.process(r#"garbage}{"op":"unsubscribe","topic":"/a"}"#).unwrap();
        assert_eq!(value, Some(json!({"op": "unsubscribe", "topic": "/a"})));
        assert!(framer.is_empty());
    }

    #[test]
    fn objects_without_op_are_skipped_during_recovery() {
        let mut framer = MessageFramer::default();
        let value = framer
            .process(r#"{"foo":1} {"op":"unsubscribe","topic":"/a"}"#)
            .unwrap();
        assert_eq!(value, Some(json!({"op": "unsubscribe", "topic": "/a"})));
    }

    #[test]
    fn whole_buffer_without_op_is_still_returned() {
        let mut framer = MessageFramer::default();
        let value = framer.process(r#"{"baz":"baz"}"#).unwrap();
        assert_eq!(value, Some(json!({"baz": "baz"})));
    }

    #[test]
    fn hopeless_input_is_dropped() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.process("not json at all").unwrap(), None);
        assert!(framer.is_empty());

        assert_eq!(framer.process("{bad}").unwrap(), None);
        assert!(framer.is_empty());
    }

    #[test]
    fn broken_start_before_partial_command() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.process(r#"{oops}{"op":"publish""#).unwrap(), None);
        assert_eq!(framer.buffered(), r#"{"op":"publish""#);
    }

    #[test]
    fn whitespace_only_input_is_ignored() {
        let mut framer = MessageFramer::default();
        assert_eq!(framer.process("  \n").unwrap(), None);
        assert!(framer.is_empty());
    }

    #[test]
    fn overflow_is_fatal_and_clears_the_buffer() {
        let mut framer = MessageFramer::new(16);
        assert_eq!(framer.process(r#"{"op":"pub"#).unwrap(), None);
        let err = framer.process(r#"lish","topic":"/a""#).unwrap_err();
        assert_eq!(err, BridgeError::FrameOverflow { limit: 16 });
        assert!(framer.is_empty());
    }
}
