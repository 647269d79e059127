//! Newline-delimited JSON framing.
//!
//! Wire format: one JSON object per line, UTF-8, `\n` terminated.

use crate::error::{RpcError, RpcResult};
use crate::types::{Incoming, Outgoing};
use futures::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Maximum accepted line length (1 MB).
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

pub struct MessageReader<R> {
    lines: FramedRead<R, LinesCodec>,
    /// After a decode error the stream yields one `None` before it resumes.
    resuming: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            resuming: false,
        }
    }

    /// Reads the next non-blank line.
    ///
    /// Returns `Ok(None)` at end of input. Lines that fail to parse, are too
    /// long or are not UTF-8 come back as `Ok(Some(Err(..)))` so the caller
    /// can report them and keep going. Overlong lines are discarded without
    /// being buffered.
    pub async fn next_message(&mut self) -> io::Result<Option<RpcResult<Incoming>>> {
        loop {
            match self.lines.next().await {
                None if self.resuming => {
                    self.resuming = false;
                }
                None => return Ok(None),
                Some(Ok(line)) => {
                    self.resuming = false;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(Incoming::parse_line(line)));
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    self.resuming = true;
                    return Ok(Some(Err(RpcError::Exception(format!(
                        "Line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    )))));
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                    self.resuming = true;
                    return Ok(Some(Err(RpcError::Exception(e.to_string()))));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(e),
            }
        }
    }
}

/// Writes one message as a single line and flushes.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Outgoing,
) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Body, Command};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_reads_messages_and_skips_blank_lines() {
        let input = b"{\"action\": \"get\"}\n\n  \n{\"signal\": \"cancel\"}\n" as &[u8];
        let mut reader = MessageReader::new(input);

        let first = reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(first, Incoming::Command(Command::new("get")));

        let second = reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(second, Incoming::Signal("cancel".to_string()));

        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_line_does_not_end_stream() {
        let input = b"garbage\n{\"action\": \"scan\"}\n" as &[u8];
        let mut reader = MessageReader::new(input);

        assert!(reader.next_message().await.unwrap().unwrap().is_err());
        assert!(reader.next_message().await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_overlong_line_is_reported_and_skipped() {
        let mut input = b"{\"signal\": \"".to_vec();
        input.extend(std::iter::repeat(b'x').take(MAX_LINE_LENGTH + 10));
        input.extend_from_slice(b"\"}\n{\"action\": \"get\"}\n");
        let mut reader = MessageReader::new(input.as_slice());

        let err = reader.next_message().await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.status(), "exception");
        assert!(err.to_string().contains("exceeds"));

        let next = reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(next, Incoming::Command(Command::new("get")));
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_end_stream() {
        let input = b"\xff\xfe\n{\"action\": \"get\"}\n" as &[u8];
        let mut reader = MessageReader::new(input);

        assert!(reader.next_message().await.unwrap().unwrap().is_err());
        assert!(reader.next_message().await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_message_is_one_line() {
        let mut buf = Vec::new();
        let mut body = Body::new();
        body.insert("key".to_string(), json!("00ff"));
        write_message(&mut buf, &Outgoing::success(body)).await.unwrap();
        write_message(&mut buf, &Outgoing::signal("capture", Body::new()))
            .await
            .unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, json!({"result": "success", "key": "00ff"}));
    }

    #[tokio::test]
    async fn test_write_message_exact_bytes() {
        let mut writer = tokio_test::io::Builder::new()
            .write(b"{\"signal\":\"capture\"}\n")
            .build();
        write_message(&mut writer, &Outgoing::signal("capture", Body::new()))
            .await
            .unwrap();
    }
}
