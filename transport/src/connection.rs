//! A single framed, bidirectional command/response connection.
//!
//! Frames are length-delimited byte strings; within a frame the first
//! field is the command/response name, followed by its chunked
//! argument dictionary (see [`crate::codec`]). Liveness is maintained
//! by a keepalive [`Command::Noop`] sent every [`PING_INTERVAL`]; a
//! connection that hears nothing at all, ping or otherwise, for
//! [`INACTIVITY_TIMEOUT`] is treated as dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::codec::{decode_command, decode_response, encode_command, encode_response};
use crate::command::{Command, RequestId, Response};
use crate::error::TransportError;

/// Liveness ping cadence on an idle connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection with no inbound traffic at all for this long is torn
/// down.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(2 * PING_INTERVAL.as_secs());

const LENGTH_PREFIX_BYTES: usize = 4;

/// One wire frame: a command or response name plus its argument
/// dictionary, each argument already chunked per [`crate::codec::chunk`].
struct Frame {
    request_id: RequestId,
    name: String,
    args: Vec<(String, Vec<u8>)>,
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(frame.request_id.0.to_be_bytes());
    body.extend((frame.name.len() as u32).to_be_bytes());
    body.extend(frame.name.as_bytes());
    body.extend((frame.args.len() as u32).to_be_bytes());
    for (name, bytes) in &frame.args {
        body.extend((name.len() as u32).to_be_bytes());
        body.extend(name.as_bytes());
        body.extend((bytes.len() as u32).to_be_bytes());
        body.extend(bytes);
    }
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    framed.extend((body.len() as u32).to_be_bytes());
    framed.extend(body);
    framed
}

fn decode_frame(body: &[u8]) -> Result<Frame, TransportError> {
    let mut buf = body;
    let take = |buf: &mut &[u8], n: usize| -> Result<Vec<u8>, TransportError> {
        if buf.len() < n {
            return Err(TransportError::ProtocolViolation("truncated frame".to_string()));
        }
        let (head, rest) = buf.split_at(n);
        *buf = rest;
        Ok(head.to_vec())
    };
    let u32_field = |buf: &mut &[u8]| -> Result<u32, TransportError> {
        Ok(u32::from_be_bytes(take(buf, 4)?.try_into().unwrap()))
    };
    let request_id = RequestId(u64::from_be_bytes(take(&mut buf, 8)?.try_into().unwrap()));
    let name_len = u32_field(&mut buf)? as usize;
    let name = String::from_utf8(take(&mut buf, name_len)?)
        .map_err(|_| TransportError::ProtocolViolation("invalid utf8 in frame name".to_string()))?;
    let arg_count = u32_field(&mut buf)?;
    let mut args = Vec::with_capacity(arg_count as usize);
    for _ in 0..arg_count {
        let arg_name_len = u32_field(&mut buf)? as usize;
        let arg_name = String::from_utf8(take(&mut buf, arg_name_len)?)
            .map_err(|_| TransportError::ProtocolViolation("invalid utf8 in arg name".to_string()))?;
        let arg_len = u32_field(&mut buf)? as usize;
        let arg_bytes = take(&mut buf, arg_len)?;
        args.push((arg_name, arg_bytes));
    }
    Ok(Frame { request_id, name, args })
}

enum Inbound {
    Command(RequestId, Command),
    Response(RequestId, Response),
}

/// One open connection. Cloning shares the same underlying write half
/// and pending-request table, so any clone can issue a command and
/// await its response.
#[derive(Clone)]
pub struct Connection {
    writer: Arc<Mutex<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    next_request_id: Arc<AtomicU64>,
    inbound_commands: mpsc::UnboundedSender<(RequestId, Command)>,
}

impl Connection {
    /// Splits `stream` into read/write halves and spawns the frame
    /// reader loop. `inbound_commands` receives every peer-originated
    /// [`Command`] (with the [`RequestId`] to reply against);
    /// responses to our own requests are routed internally and never
    /// appear there.
    pub fn spawn<S>(stream: S, inbound_commands: mpsc::UnboundedSender<(RequestId, Command)>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let connection = Connection {
            writer: Arc::new(Mutex::new(write_half)),
            pending: pending.clone(),
            next_request_id: Arc::new(AtomicU64::new(1)),
            inbound_commands,
        };
        let reader_pending = pending;
        let reader_commands = connection.inbound_commands.clone();
        tokio::spawn(read_loop(read_half, reader_pending, reader_commands));
        connection
    }

    /// Sends `command` and waits for the correlated response, or for
    /// [`INACTIVITY_TIMEOUT`] to elapse first.
    pub async fn call(&self, command: Command) -> Result<Response, TransportError> {
        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.0, tx);
        self.write_command(request_id, &command).await?;
        match timeout(INACTIVITY_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Transient(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection closed while awaiting response",
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&request_id.0);
                Err(TransportError::InactivityTimeout(INACTIVITY_TIMEOUT))
            }
        }
    }

    /// Sends `command` without waiting for a response, for fire-and-forget
    /// traffic ([`Command::Noop`] keepalives).
    pub async fn notify(&self, command: Command) -> Result<(), TransportError> {
        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        self.write_command(request_id, &command).await
    }

    /// Replies to a peer-originated command identified by `request_id`.
    pub async fn respond(&self, request_id: RequestId, response: Response) -> Result<(), TransportError> {
        let bytes = encode_response(&response);
        let frame = Frame {
            request_id,
            name: "RESPONSE".to_string(),
            args: vec![("body".to_string(), bytes)],
        };
        self.write_frame(&frame).await
    }

    async fn write_command(&self, request_id: RequestId, command: &Command) -> Result<(), TransportError> {
        let (name, args) = encode_command(command);
        self.write_frame(&Frame { request_id, name, args }).await
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = encode_frame(frame);
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await.map_err(TransportError::Transient)
    }

    /// Spawns the keepalive loop: sends [`Command::Noop`] every
    /// [`PING_INTERVAL`] until the connection is dropped.
    pub fn spawn_keepalive(&self) {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if connection.notify(Command::Noop).await.is_err() {
                    debug!("keepalive send failed, connection presumed dead");
                    return;
                }
            }
        });
    }
}

async fn read_loop<R>(
    mut reader: R,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    inbound_commands: mpsc::UnboundedSender<(RequestId, Command)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        match timeout(INACTIVITY_TIMEOUT, read_one_frame(&mut reader, &mut buf)).await {
            Ok(Ok(Some(frame))) => match classify(frame) {
                Ok(Inbound::Response(request_id, response)) => {
                    if let Some(tx) = pending.lock().await.remove(&request_id.0) {
                        let _ = tx.send(response);
                    }
                }
                Ok(Inbound::Command(request_id, command)) => {
                    if inbound_commands.send((request_id, command)).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    warn!(%error, "dropping connection after protocol violation");
                    return;
                }
            },
            Ok(Ok(None)) => return,
            Ok(Err(error)) => {
                warn!(%error, "dropping connection after transport error");
                return;
            }
            Err(_) => {
                warn!("dropping connection after inactivity timeout");
                return;
            }
        }
    }
}

fn classify(frame: Frame) -> Result<Inbound, TransportError> {
    if frame.name == "RESPONSE" {
        let bytes = frame
            .args
            .into_iter()
            .find(|(name, _)| name == "body")
            .map(|(_, bytes)| bytes)
            .ok_or_else(|| TransportError::ProtocolViolation("response frame missing body".to_string()))?;
        Ok(Inbound::Response(frame.request_id, decode_response(&bytes)?))
    } else {
        Ok(Inbound::Command(
            frame.request_id,
            decode_command(&frame.name, frame.args)?,
        ))
    }
}

async fn read_one_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    while buf.len() < LENGTH_PREFIX_BYTES {
        if !fill(reader, buf).await? {
            return Ok(None);
        }
    }
    let len = u32::from_be_bytes(buf[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
    while buf.len() < LENGTH_PREFIX_BYTES + len {
        if !fill(reader, buf).await? {
            return Ok(None);
        }
    }
    buf.advance(LENGTH_PREFIX_BYTES);
    let body = buf.split_to(len);
    Ok(Some(decode_frame(&body)?))
}

async fn fill<R>(reader: &mut R, buf: &mut BytesMut) -> Result<bool, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let n = reader.read(&mut chunk).await.map_err(TransportError::Transient)?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_through_encode_decode() {
        let frame = Frame {
            request_id: RequestId(42),
            name: "NODE_STATE".to_string(),
            args: vec![("eliot_context".to_string(), b"ctx".to_vec())],
        };
        let bytes = encode_frame(&frame);
        let body = &bytes[LENGTH_PREFIX_BYTES..];
        let decoded = decode_frame(body).unwrap();
        assert_eq!(decoded.request_id.0, 42);
        assert_eq!(decoded.name, "NODE_STATE");
        assert_eq!(decoded.args, frame.args);
    }

    #[tokio::test]
    async fn call_and_respond_over_an_in_memory_duplex() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let server = Connection::spawn(server_io, server_tx);
        let (_client_tx, client_rx_unused) = mpsc::unbounded_channel();
        let client = Connection::spawn(client_io, _client_tx);
        drop(client_rx_unused);

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call(Command::Noop).await }
        });

        let (request_id, command) = server_rx.recv().await.unwrap();
        assert_eq!(command, Command::Noop);
        server
            .respond(request_id, Response::Empty)
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), Response::Empty);
    }
}
