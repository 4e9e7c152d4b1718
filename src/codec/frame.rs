//! Frame encoding and decoding.

use std::io;

use async_trait::async_trait;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::Mutex;

use super::{CodecError, FrameSink, MAX_LABELS, MAX_LINE_BYTES, MAX_PAYLOAD_BYTES};
use crate::domain::{Labels, Message, Payload};

fn check_token(token: &str) -> Result<(), CodecError> {
    if token.is_empty() || token.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(CodecError::InvalidToken(token.to_string()));
    }
    Ok(())
}

/// Encode one message as a complete frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    check_token(&message.channel)?;
    check_token(&message.subject)?;

    let payload = message.payload_bytes()?;
    let mut frame = format!(
        "{} {} {} {}\n",
        message.channel,
        message.subject,
        message.labels.len(),
        payload.len()
    )
    .into_bytes();

    for (name, value) in &message.labels {
        check_token(name)?;
        frame.extend_from_slice(format!("{} {}\n", name, value.len()).as_bytes());
        frame.extend_from_slice(value.as_bytes());
    }

    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Writing half of a framed pipe.
///
/// The writer sits behind its own lock: one lock per writer instance, so
/// unrelated pipes never contend.
pub struct FrameWriter<W> {
    inner: Mutex<Option<W>>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            inner: Mutex::new(Some(writer)),
        }
    }

    /// Write one frame atomically with respect to other senders
    pub async fn send(&self, message: &Message) -> Result<(), CodecError> {
        let frame = encode_frame(message)?;

        let mut guard = self.inner.lock().await;
        let writer = guard.as_mut().ok_or(CodecError::Closed)?;
        writer
            .write_all(&frame)
            .await
            .map_err(CodecError::from_write)?;
        writer.flush().await.map_err(CodecError::from_write)
    }

    /// Shut down and drop the underlying writer. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.inner.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&self, message: &Message) -> Result<(), CodecError> {
        self.send(message).await
    }
}

/// Reading half of a framed pipe
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns [`CodecError::Closed`] when the stream ends cleanly between
    /// frames. The returned message always carries a raw payload.
    pub async fn fetch(&mut self) -> Result<Message, CodecError> {
        let header = match self.read_line().await? {
            Some(line) => line,
            None => return Err(CodecError::Closed),
        };

        let tokens: Vec<&str> = header.split_ascii_whitespace().collect();
        let [channel, subject, num_labels, size] = tokens.as_slice() else {
            return Err(CodecError::Malformed(format!(
                "expected 4 header fields, got {:?}",
                header
            )));
        };

        let num_labels = parse_count(num_labels, "label count", MAX_LABELS)?;
        let size = parse_count(size, "payload size", MAX_PAYLOAD_BYTES)?;

        let mut message = Message::new(*channel, *subject);
        message.labels = self.read_labels(num_labels).await?;
        message.payload = Payload::Raw(self.read_exact(size, "payload").await?);

        Ok(message)
    }

    async fn read_labels(&mut self, count: usize) -> Result<Labels, CodecError> {
        let mut labels = Labels::new();

        for index in 0..count {
            let line = self.read_line().await?.ok_or_else(|| {
                CodecError::Truncated(format!("stream ended before label {}", index))
            })?;

            let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
            let [name, len] = tokens.as_slice() else {
                return Err(CodecError::Malformed(format!(
                    "expected 2 label header fields, got {:?}",
                    line
                )));
            };

            let len = parse_count(len, "label length", MAX_PAYLOAD_BYTES)?;
            let value = self.read_exact(len, "label value").await?;
            let value = String::from_utf8(value).map_err(|_| {
                CodecError::Malformed(format!("label {} is not valid UTF-8", name))
            })?;

            labels.insert(name.to_string(), value);
        }

        Ok(labels)
    }

    /// Read one newline-terminated line; `None` on EOF before any byte
    async fn read_line(&mut self) -> Result<Option<String>, CodecError> {
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await?;

        if read == 0 {
            return Ok(None);
        }

        if buf.last() != Some(&b'\n') {
            if buf.len() >= MAX_LINE_BYTES {
                return Err(CodecError::Malformed(format!(
                    "header line exceeds {} bytes",
                    MAX_LINE_BYTES
                )));
            }
            return Err(CodecError::Truncated("stream ended inside a header line".into()));
        }

        buf.pop();
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| CodecError::Malformed("header line is not valid UTF-8".into()))
    }

    async fn read_exact(&mut self, len: usize, what: &str) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0u8; len];
        match self.inner.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CodecError::Truncated(
                format!("stream ended inside {} ({} bytes expected)", what, len),
            )),
            Err(e) => Err(CodecError::Io(e)),
        }
    }
}

fn parse_count(token: &str, what: &str, limit: usize) -> Result<usize, CodecError> {
    let value: usize = token
        .parse()
        .map_err(|_| CodecError::Malformed(format!("invalid {} {:?}", what, token)))?;

    if value > limit {
        return Err(CodecError::Malformed(format!(
            "{} {} exceeds limit {}",
            what, value, limit
        )));
    }

    Ok(value)
}
