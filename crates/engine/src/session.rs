//! Per-connection upload session.
//!
//! Chunks accumulate until the transport marks one final; the whole buffer is
//! then submitted to the engine as one script. The buffer is bounded: going
//! over the cap ends the session without compiling anything.
//!
//! Replies ("Accepted" or an error string) wait in a bounded [`Outbox`] until
//! the transport is writable. A full outbox drops the newest reply.

use std::collections::VecDeque;

use crate::engine::Engine;
use crate::error::{ScriptError, UploadError};

/// Maximum upload size in bytes.
pub const LUA_CODE_LEN: usize = 1024 * 1024;

/// Default per-connection reply queue depth.
pub const OUTBOX_DEPTH: usize = 20;

/// Reply sent for a published upload.
pub const ACCEPTED: &str = "Accepted";

/// Bounded FIFO of outbound text notifications.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Queue a message. Returns false (and counts a drop) when full.
    pub fn push(&mut self, message: String) -> bool {
        if self.queue.len() >= self.capacity {
            self.dropped += 1;
            log::debug!("Outbox full ({}), dropping notification", self.capacity);
            return false;
        }
        self.queue.push_back(message);
        true
    }

    pub fn pop(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Accumulation buffer and reply queue for one connection.
pub struct UploadSession {
    engine: Engine,
    buffer: Vec<u8>,
    max_upload: usize,
    outbox: Outbox,
    closed: bool,
}

impl UploadSession {
    pub fn new(engine: Engine, max_upload: usize, outbox_depth: usize) -> Self {
        Self {
            engine,
            buffer: Vec::new(),
            max_upload,
            outbox: Outbox::new(outbox_depth),
            closed: false,
        }
    }

    /// Feed one transport chunk.
    ///
    /// On the final chunk the buffered script is submitted and a reply is
    /// queued. An error is terminal: the caller must close the connection.
    pub fn receive(&mut self, chunk: &[u8], is_final: bool) -> Result<(), UploadError> {
        if self.closed {
            return Err(UploadError::Closed);
        }

        let attempted = self.buffer.len() + chunk.len();
        if attempted > self.max_upload {
            self.closed = true;
            self.buffer = Vec::new();
            log::warn!("Upload rejected: {} bytes exceeds limit of {}", attempted, self.max_upload);
            return Err(UploadError::TooLarge { limit: self.max_upload, attempted });
        }
        self.buffer.extend_from_slice(chunk);

        if is_final {
            let source = std::mem::take(&mut self.buffer);
            let reply = self.submit(&source);
            self.outbox.push(reply);
        }
        Ok(())
    }

    fn submit(&self, source: &[u8]) -> String {
        let text = match std::str::from_utf8(source) {
            Ok(text) => text,
            Err(e) => {
                let err = ScriptError::Compile(format!("source is not valid UTF-8: {}", e));
                log::info!("Upload rejected: {}", err);
                return err.to_string();
            }
        };

        match self.engine.submit(text) {
            Ok(delay) => {
                log::info!("Upload accepted ({} bytes, delay {})", text.len(), delay);
                ACCEPTED.to_string()
            }
            Err(err) => {
                log::info!("Upload rejected: {}", err);
                err.to_string()
            }
        }
    }

    /// Next reply to send, oldest first.
    pub fn next_notification(&mut self) -> Option<String> {
        self.outbox.pop()
    }

    pub fn has_pending(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes buffered towards the current message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Delay;
    use crate::sandbox::{Sandbox, SandboxConfig};
    use crate::sink::RecordingSink;
    use proptest::prelude::*;

    fn engine() -> (Engine, RecordingSink) {
        let sink = RecordingSink::new();
        let sandbox = Sandbox::new(SandboxConfig { pixel_count: 1, ..Default::default() }).unwrap();
        (Engine::new(sandbox, Box::new(sink.clone())), sink)
    }

    #[test]
    fn test_outbox_drops_newest_when_full() {
        let mut outbox = Outbox::new(2);
        assert!(outbox.push("a".into()));
        assert!(outbox.push("b".into()));
        assert!(!outbox.push("c".into()));
        assert_eq!(outbox.dropped(), 1);
        assert_eq!(outbox.pop().as_deref(), Some("a"));
        assert_eq!(outbox.pop().as_deref(), Some("b"));
        assert_eq!(outbox.pop(), None);
    }

    #[test]
    fn test_chunks_accumulate_until_final() {
        let (engine, sink) = engine();
        let mut session = UploadSession::new(engine.clone(), LUA_CODE_LEN, OUTBOX_DEPTH);

        session.receive(b"return {255, ", false).unwrap();
        session.receive(b"0, 0}, ", false).unwrap();
        assert!(!session.has_pending());
        assert_eq!(engine.metrics().snapshot().compiles, 0);

        session.receive(b"1000", true).unwrap();
        assert_eq!(session.next_notification().as_deref(), Some(ACCEPTED));
        assert_eq!(session.buffered(), 0);
        assert_eq!(sink.frames(), vec![vec![255, 0, 0]]);
        assert_eq!(engine.reset_signal().take(), Some(Delay::Millis(1000)));
    }

    #[test]
    fn test_failure_reported_to_sender_only() {
        let (engine, sink) = engine();
        let mut session = UploadSession::new(engine.clone(), LUA_CODE_LEN, OUTBOX_DEPTH);

        session.receive(b"return {1, 2}", true).unwrap();
        let reply = session.next_notification().unwrap();
        assert!(reply.starts_with("Runtime error:"), "{}", reply);

        session.receive(b"return {", true).unwrap();
        let reply = session.next_notification().unwrap();
        assert!(reply.starts_with("Compile error:"), "{}", reply);

        assert!(!engine.reset_signal().is_pending());
        assert!(engine.current_source().is_none());
        assert_eq!(sink.count(), 0);
        // Session stays usable after a failed script
        session.receive(b"return {0, 0, 0}", true).unwrap();
        assert_eq!(session.next_notification().as_deref(), Some(ACCEPTED));
    }

    #[test]
    fn test_invalid_utf8_is_compile_error() {
        let (engine, _sink) = engine();
        let mut session = UploadSession::new(engine.clone(), LUA_CODE_LEN, OUTBOX_DEPTH);
        session.receive(&[0xff, 0xfe, 0x00], true).unwrap();
        let reply = session.next_notification().unwrap();
        assert!(reply.contains("not valid UTF-8"));
        assert_eq!(engine.metrics().snapshot().compiles, 0);
    }

    #[test]
    fn test_oversize_never_compiles() {
        let (engine, _sink) = engine();
        let limit = 64;
        let mut session = UploadSession::new(engine.clone(), limit, OUTBOX_DEPTH);

        session.receive(&[b' '; 40], false).unwrap();
        let err = session.receive(&[b' '; 25], true).unwrap_err();
        assert_eq!(err, UploadError::TooLarge { limit, attempted: 65 });
        assert!(session.is_closed());
        assert_eq!(session.receive(b"return {0,0,0}", true), Err(UploadError::Closed));
        assert_eq!(engine.metrics().snapshot().compiles, 0);
        assert!(!session.has_pending());
    }

    #[test]
    fn test_full_outbox_drops_replies() {
        let (engine, _sink) = engine();
        let mut session = UploadSession::new(engine, LUA_CODE_LEN, 2);
        for _ in 0..5 {
            session.receive(b"return {0, 0, 0}, 5", true).unwrap();
        }
        assert_eq!(session.outbox().len(), 2);
        assert_eq!(session.outbox().dropped(), 3);
    }

    proptest! {
        #[test]
        fn prop_outbox_never_exceeds_capacity(capacity in 1usize..32, pushes in 0usize..100) {
            let mut outbox = Outbox::new(capacity);
            for i in 0..pushes {
                outbox.push(i.to_string());
            }
            prop_assert!(outbox.len() <= capacity);
            prop_assert_eq!(outbox.len() as u64 + outbox.dropped(), pushes as u64);
            // Survivors are the oldest messages, in order
            for i in 0..outbox.len() {
                prop_assert_eq!(outbox.pop(), Some(i.to_string()));
            }
        }

        #[test]
        fn prop_upload_cap_is_exact(limit in 1usize..256, sizes in proptest::collection::vec(0usize..64, 1..12)) {
            let (engine, _sink) = engine();
            let mut session = UploadSession::new(engine.clone(), limit, OUTBOX_DEPTH);
            let mut total = 0;
            for size in &sizes {
                total += size;
                let result = session.receive(&vec![b' '; *size], false);
                if total > limit {
                    prop_assert!(result.is_err());
                    prop_assert!(session.is_closed());
                    break;
                }
                prop_assert!(result.is_ok());
                prop_assert_eq!(session.buffered(), total);
            }
            prop_assert_eq!(engine.metrics().snapshot().compiles, 0);
        }
    }
}
