//! Message codec for the RPC wire protocol.
//!
//! Message format:
//! ```text
//! ┌──────────────────────────────┬────┐
//! │   JSON object (UTF-8)        │ \n │
//! └──────────────────────────────┴────┘
//! ```
//! Messages are self-delimiting JSON values. Writers end each one with a
//! newline; readers do not depend on it, so a message may span lines and
//! several messages may share one. Whitespace between messages is ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

fn invalid_data(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}

fn too_large(max_message_bytes: usize) -> std::io::Error {
    invalid_data(format!("Message too large: exceeds {} bytes", max_message_bytes))
}

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// The value is still open after these bytes.
    Partial,
    /// The value ends after this many bytes of the chunk.
    Complete(usize),
    /// A message must start with `{` or `[`.
    Unexpected(u8),
}

/// Finds where a top-level JSON object or array ends, across chunk
/// boundaries. Nesting and strings are tracked; everything else is left to
/// the JSON parser.
#[derive(Debug, Default)]
struct FrameScanner {
    started: bool,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameScanner {
    fn feed(&mut self, chunk: &[u8]) -> Scan {
        for (i, &b) in chunk.iter().enumerate() {
            if !self.started {
                match b {
                    b'{' | b'[' => {
                        self.started = true;
                        self.depth = 1;
                    }
                    b if b.is_ascii_whitespace() => {}
                    other => return Scan::Unexpected(other),
                }
                continue;
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Scan::Complete(i + 1);
                    }
                }
                _ => {}
            }
        }
        Scan::Partial
    }
}

/// Read one message from the stream.
///
/// Returns `None` on clean EOF between messages. Bytes after the message
/// stay buffered in `reader` for the next call. `max_message_bytes` caps
/// the encoded size of one message.
pub async fn read_message<R, T>(
    reader: &mut R,
    max_message_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut scanner = FrameScanner::default();
    let mut frame = Vec::new();
    loop {
        let (consumed, complete) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                if scanner.started {
                    return Err(invalid_data("Invalid message: unexpected EOF"));
                }
                return Ok(None);
            }
            match scanner.feed(chunk) {
                Scan::Complete(n) => {
                    frame.extend_from_slice(&chunk[..n]);
                    (n, true)
                }
                Scan::Partial => {
                    frame.extend_from_slice(chunk);
                    (chunk.len(), false)
                }
                Scan::Unexpected(b) => {
                    return Err(invalid_data(format!(
                        "Invalid message: expected a JSON object, found {:?}",
                        char::from(b)
                    )));
                }
            }
        };
        reader.consume(consumed);

        if !scanner.started {
            // Only whitespace so far.
            frame.clear();
            continue;
        }
        if frame.len() > max_message_bytes {
            return Err(too_large(max_message_bytes));
        }
        if complete {
            return serde_json::from_slice(&frame)
                .map(Some)
                .map_err(|e| invalid_data(format!("Invalid message: {}", e)));
        }
    }
}

/// Write one message to the stream and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(message).map_err(|e| {
        tracing::error!("Message encoding failed: {}", e);
        invalid_data(e.to_string())
    })?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
