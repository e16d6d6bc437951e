//! Output streaming for stage containers

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

/// Maximum output kept per stream; the tail is kept since errors come last
pub(crate) const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Marker prepended when output was truncated
pub(crate) const TRUNCATION_MARKER: &str = "...[truncated - showing last 1 MiB of output]...\n";

/// Lines longer than this are cut
const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One chunk of live container output, forwarded for log tailing
#[derive(Debug, Clone, Serialize)]
pub struct LogChunk {
    pub container: String,
    pub stage: String,
    pub stream: OutputStream,
    pub data: String,
}

/// Accumulated output of one stream
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    data: String,
    truncated: bool,
}

impl OutputBuffer {
    pub(crate) fn push(&mut self, chunk: &str) {
        self.data.push_str(chunk);

        if self.data.len() > MAX_OUTPUT_BYTES {
            let mut start = self.data.len() - MAX_OUTPUT_BYTES;
            while !self.data.is_char_boundary(start) {
                start += 1;
            }
            self.data.drain(..start);
            self.truncated = true;
        }
    }

    pub(crate) fn into_string(self) -> String {
        if self.truncated {
            format!("{}{}", TRUNCATION_MARKER, self.data)
        } else {
            self.data
        }
    }
}

/// Reads `reader` line by line and forwards each line on `tx`
///
/// Ends at EOF, on a read error, or when the receiver is gone.
pub(crate) fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<(OutputStream, String)>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let mut line = String::from_utf8_lossy(&buf).into_owned();
                    if line.len() > MAX_LINE_LENGTH {
                        let mut end = MAX_LINE_LENGTH;
                        while !line.is_char_boundary(end) {
                            end -= 1;
                        }
                        line.truncate(end);
                        line.push_str("... [truncated]\n");
                    }
                    if tx.send((stream, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Error reading container {:?}: {}", stream, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_buffer_keeps_tail() {
        let mut buffer = OutputBuffer::default();
        buffer.push(&"a".repeat(MAX_OUTPUT_BYTES));
        buffer.push("the error at the end\n");

        let output = buffer.into_string();
        assert!(output.starts_with(TRUNCATION_MARKER));
        assert!(output.ends_with("the error at the end\n"));
        assert_eq!(output.len(), TRUNCATION_MARKER.len() + MAX_OUTPUT_BYTES);
    }

    #[test]
    fn test_output_buffer_small_output_untouched() {
        let mut buffer = OutputBuffer::default();
        buffer.push("line 1\n");
        buffer.push("line 2\n");
        assert_eq!(buffer.into_string(), "line 1\nline 2\n");
    }

    #[tokio::test]
    async fn test_reader_forwards_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"first\nsecond\npartial";

        spawn_reader(input, OutputStream::Stdout, tx).await.unwrap();

        let mut lines = Vec::new();
        while let Some((stream, line)) = rx.recv().await {
            assert_eq!(stream, OutputStream::Stdout);
            lines.push(line);
        }
        assert_eq!(lines, vec!["first\n", "second\n", "partial"]);
    }
}
