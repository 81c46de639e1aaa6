//! Bounded stdout/stderr capture shared between the manager and an executor.
//!
//! The manager owns the capture, so whatever was produced before a
//! deadline or cancellation is still reported.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Buffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Buffer {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }
}

/// Text captured from one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

#[derive(Debug, Clone)]
pub struct OutputCapture {
    limit: usize,
    inner: Arc<Mutex<(Buffer, Buffer)>>,
}

impl OutputCapture {
    /// `limit` is the per-stream byte ceiling.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new((Buffer::default(), Buffer::default()))),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn append(&self, stream: Stream, chunk: &[u8]) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buffer = match stream {
            Stream::Stdout => &mut guard.0,
            Stream::Stderr => &mut guard.1,
        };
        buffer.push(chunk, self.limit);
    }

    /// Copy `reader` into the capture until EOF.
    ///
    /// Keeps reading past the ceiling so the writer never blocks on a full pipe.
    pub async fn pump<R>(self, stream: Stream, mut reader: R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.append(stream, &chunk[..n]);
        }
    }

    pub fn snapshot(&self) -> CapturedOutput {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        CapturedOutput {
            stdout: to_text(&guard.0.bytes),
            stderr: to_text(&guard.1.bytes),
            stdout_truncated: guard.0.truncated,
            stderr_truncated: guard.1.truncated,
        }
    }
}

/// Lossy UTF-8, dropping a multi-byte character cut in half by truncation.
fn to_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_is_kept_whole() {
        let capture = OutputCapture::new(16);
        capture.append(Stream::Stdout, b"hello ");
        capture.append(Stream::Stdout, b"world");
        capture.append(Stream::Stderr, b"warn");

        let out = capture.snapshot();
        assert_eq!(out.stdout, "hello world");
        assert_eq!(out.stderr, "warn");
        assert!(!out.stdout_truncated);
        assert!(!out.stderr_truncated);
    }

    #[test]
    fn test_truncates_at_ceiling() {
        let capture = OutputCapture::new(10);
        capture.append(Stream::Stdout, b"0123456");
        capture.append(Stream::Stdout, b"789abcdef");
        capture.append(Stream::Stdout, b"more");

        let out = capture.snapshot();
        assert_eq!(out.stdout, "0123456789");
        assert!(out.stdout_truncated);
        assert!(!out.stderr_truncated);
    }

    #[test]
    fn test_split_multibyte_char_is_dropped() {
        let capture = OutputCapture::new(4);
        // "aé€": a(1) é(2) €(3); the ceiling falls inside €.
        capture.append(Stream::Stdout, "aé€".as_bytes());
        let out = capture.snapshot();
        assert_eq!(out.stdout, "aé");
        assert!(out.stdout.len() <= 4);
    }

    #[tokio::test]
    async fn test_pump_drains_past_ceiling() {
        let capture = OutputCapture::new(100);
        let data = vec![b'x'; 100_000];
        capture
            .clone()
            .pump(Stream::Stderr, &data[..])
            .await
            .unwrap();

        let out = capture.snapshot();
        assert_eq!(out.stderr.len(), 100);
        assert!(out.stderr_truncated);
    }
}
