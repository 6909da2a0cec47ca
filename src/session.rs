//! Line-protocol session run on an admitted connection.
//!
//! Protocol (one exchange per connection, newline-terminated UTF-8):
//!
//! ```text
//! S: The server has received your message.
//!    (processing delay)
//! C: <request>
//! S: The server has received your message: <request>, processing completed.
//! S: END
//! ```
//!
//! If the client closes its write side before sending a line, the reply is
//! skipped and only `END` follows the acknowledgment.

use crate::connection::{ConnectionHandle, TcpConnection};
use crate::error::SessionError;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, warn};

/// Sent as soon as a connection is admitted.
pub const ACK_LINE: &str = "The server has received your message.";

/// Terminates every session.
pub const END_MARKER: &str = "END";

/// Longest request line accepted, in bytes.
const MAX_LINE_LEN: u64 = 64 * 1024;

/// Per-connection logic executed on a pool slot.
///
/// Implementations own the connection for the whole call and must contain
/// their own failures: the future resolves to `()` whatever happened.
pub trait SessionHandler<C>: Send + Sync + 'static {
    fn serve(&self, conn: C) -> impl Future<Output = ()> + Send;
}

/// Reply line for a request.
pub fn reply_line(request: &str) -> String {
    format!("The server has received your message: {request}, processing completed.")
}

/// The acknowledgment / delay / echo / END session.
#[derive(Debug, Clone)]
pub struct LineSession {
    processing_delay: Duration,
}

impl LineSession {
    pub fn new(processing_delay: Duration) -> Self {
        Self { processing_delay }
    }

    /// Run one exchange over `stream`.
    pub async fn run<S>(&self, stream: S, peer: SocketAddr) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        write_line(&mut writer, ACK_LINE).await?;

        debug!(peer = %peer, delay_ms = self.processing_delay.as_millis() as u64, "Processing request");
        tokio::time::sleep(self.processing_delay).await;

        match read_request(&mut reader).await? {
            Some(request) => {
                info!(peer = %peer, request = %request, "Received request");
                write_line(&mut writer, &reply_line(&request)).await?;
            }
            None => debug!(peer = %peer, "Client sent no request"),
        }

        write_line(&mut writer, END_MARKER).await?;
        writer.shutdown().await?;
        Ok(())
    }
}

impl SessionHandler<TcpConnection> for LineSession {
    async fn serve(&self, conn: TcpConnection) {
        let peer = conn.peer();
        if let Err(e) = self.run(conn.into_stream(), peer).await {
            warn!(peer = %peer, error = %e, "Session failed");
        }
        debug!(peer = %peer, "Session closed");
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line, without its terminator. `None` on EOF.
async fn read_request<R>(reader: &mut R) -> Result<Option<String>, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| SessionError::InvalidUtf8)
}
