//! Framed connection over one bidirectional byte stream.
//!
//! After the JSON handshake line, the stream carries frames in both
//! directions. Each frame is a `(Header, Body)` pair, both encoded by
//! the negotiated codec and length-prefixed:
//!
//! ```text
//! u32-be header_len | header | u32-be body_len | body
//! ```
//!
//! The read and write halves each sit behind their own async mutex.
//! The writer mutex is what guarantees at most one in-flight write on
//! the connection: every frame on the wire is complete, never
//! interleaved. Bodies come back as raw bytes so the caller can decode
//! them into the precise per-method type, or drop them to drain a frame
//! nobody is waiting for.
//!
//! Any write error poisons the connection; a desynchronized peer would
//! otherwise misparse every following frame.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{CodecType, Header};
use crate::error::RpcError;
use crate::options::Options;

/// Sanity limit for a single header or body section.
const MAX_SECTION_LEN: u32 = 8 * 1024 * 1024;

type ReadHalf = BufReader<Box<dyn AsyncRead + Send + Unpin>>;
type WriteHalf = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

pub(crate) struct Conn {
    reader: AsyncMutex<ReadHalf>,
    writer: AsyncMutex<WriteHalf>,
    codec: CodecType,
    closed: AtomicBool,
}

impl Conn {
    /// Client side: emit the handshake line, then frame with the codec
    /// named in `opt`.
    pub async fn connect<S>(stream: S, opt: &Options) -> Result<Self, RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut writer = BufWriter::new(Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>);
        let mut line =
            serde_json::to_vec(opt).map_err(|e| RpcError::Encode(e.to_string()))?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(Self {
            reader: AsyncMutex::new(BufReader::new(Box::new(r) as Box<dyn AsyncRead + Send + Unpin>)),
            writer: AsyncMutex::new(writer),
            codec: opt.codec_type,
            closed: AtomicBool::new(false),
        })
    }

    /// Server side: consume the handshake line and return the parsed
    /// options alongside the framed connection. The buffered reader that
    /// consumed the line is kept as the frame reader, so any frame bytes
    /// the client sent right behind the handshake are not lost.
    pub async fn accept<S>(stream: S) -> Result<(Self, Options), RpcError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        let mut reader = BufReader::new(Box::new(r) as Box<dyn AsyncRead + Send + Unpin>);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(RpcError::Closed);
        }
        let opt: Options = serde_json::from_str(line.trim_end())
            .map_err(|e| RpcError::Handshake(e.to_string()))?;
        let conn = Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(BufWriter::new(
                Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>
            )),
            codec: opt.codec_type,
            closed: AtomicBool::new(false),
        };
        Ok((conn, opt))
    }

    pub fn codec(&self) -> CodecType {
        self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write one complete frame and flush.
    pub async fn send_frame(&self, header: &Header, body: &[u8]) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let header_bytes = self.codec.encode(header)?;
        if body.len() as u64 > MAX_SECTION_LEN as u64 {
            return Err(RpcError::FrameTooLarge(body.len() as u32));
        }
        let mut w = self.writer.lock().await;
        if let Err(e) = write_frame(&mut w, &header_bytes, body).await {
            self.closed.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one complete frame. The body is returned as raw bytes.
    pub async fn recv_frame(&self) -> Result<(Header, Vec<u8>), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let mut r = self.reader.lock().await;
        let header_bytes = read_section(&mut r).await?;
        let header: Header = self.codec.decode(&header_bytes)?;
        let body = read_section(&mut r).await?;
        Ok((header, body))
    }

    /// Mark the connection closed and shut down the write half.
    /// Idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut w = self.writer.lock().await;
            let _ = w.shutdown().await;
        }
    }
}

async fn write_frame(
    w: &mut WriteHalf,
    header_bytes: &[u8],
    body: &[u8],
) -> std::io::Result<()> {
    w.write_u32(header_bytes.len() as u32).await?;
    w.write_all(header_bytes).await?;
    w.write_u32(body.len() as u32).await?;
    w.write_all(body).await?;
    w.flush().await
}

async fn read_section(r: &mut ReadHalf) -> Result<Vec<u8>, RpcError> {
    let len = r.read_u32().await?;
    if len > MAX_SECTION_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (Conn, Conn) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let opt = Options::default();
        let (client, server) = tokio::join!(Conn::connect(a, &opt), Conn::accept(b));
        let (server, accepted) = server.unwrap();
        assert_eq!(accepted, opt);
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (client, server) = pair().await;
        let body = client.codec().encode(&42u64).unwrap();
        client.send_frame(&Header::request("Foo.Sum", 1), &body).await.unwrap();

        let (header, body) = server.recv_frame().await.unwrap();
        assert_eq!(header.service_method, "Foo.Sum");
        assert_eq!(header.seq, 1);
        assert!(header.error.is_empty());
        let value: u64 = server.codec().decode(&body).unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn close_marks_both_directions() {
        let (client, server) = pair().await;
        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.send_frame(&Header::request("Foo.Sum", 1), &[]).await,
            Err(RpcError::Closed)
        ));
        // The peer observes EOF.
        assert!(matches!(server.recv_frame().await, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn handshake_rejects_garbage() {
        let (mut a, b) = tokio::io::duplex(4096);
        a.write_all(b"not json\n").await.unwrap();
        assert!(matches!(Conn::accept(b).await, Err(RpcError::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_rejects_unknown_codec() {
        let (mut a, b) = tokio::io::duplex(4096);
        a.write_all(
            b"{\"MagicNumber\":3927900,\"CodecType\":\"application/gob\",\"ConnectTimeout\":0,\"HandleTimeout\":0}\n",
        )
        .await
        .unwrap();
        assert!(matches!(Conn::accept(b).await, Err(RpcError::Handshake(_))));
    }
}
