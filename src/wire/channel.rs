use crate::wire::packet::{Command, Packet, WireError, WIRE_MAGIC};
use bytes::{Buf, Bytes};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::Duration;

/// The two logical channels of a connection. They differ only in their
/// send-timeout policy:
///
/// | channel | timeout action                                  |
/// |---------|-------------------------------------------------|
/// | Data    | raise SEND_PING for the asender, keep sending   |
/// | Meta    | abort the send, caller tears the connection down|
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelKind {
    Data,
    Meta,
}

/// Flag + wakeup the data channel uses to ask the asender for a liveness
/// probe when a send drags on.
#[derive(Default)]
pub struct PingRequest {
    flag: AtomicBool,
    notify: Notify,
}

impl PingRequest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Consume the flag if raised.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }

    /// Wait until the flag is raised, then consume it.
    pub async fn raised(&self) {
        loop {
            if self.take() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("peer closed the channel")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct FramedSender {
    logger: slog::Logger,
    kind: ChannelKind,
    io: Box<dyn AsyncWrite + Send + Unpin>,
    timeout: Duration,
    ping_request: Arc<PingRequest>,
}

impl FramedSender {
    pub fn new(
        logger: slog::Logger,
        kind: ChannelKind,
        io: Box<dyn AsyncWrite + Send + Unpin>,
        timeout: Duration,
        ping_request: Arc<PingRequest>,
    ) -> Self {
        FramedSender {
            logger,
            kind,
            io,
            timeout,
            ping_request,
        }
    }

    /// Write one frame. Returns the frame size for the caller's byte
    /// accounting.
    pub async fn send(&mut self, pkt: &Packet) -> Result<usize, SendError> {
        let frame = pkt.encode()?;
        let frame_len = frame.len();

        let grace = self.timeout;
        match self.kind {
            ChannelKind::Data => {
                let io = &mut self.io;
                let write = async move {
                    io.write_all(&frame).await?;
                    io.flush().await
                };
                tokio::pin!(write);
                loop {
                    tokio::select! {
                        res = &mut write => {
                            res?;
                            return Ok(frame_len);
                        }
                        _ = tokio::time::sleep(grace) => {
                            // Just an "are you alive?" probe; the send
                            // itself continues.
                            slog::warn!(self.logger, "data channel send expired, requesting ping");
                            self.ping_request.raise();
                        }
                    }
                }
            }
            ChannelKind::Meta => {
                let io = &mut self.io;
                let write = async move {
                    io.write_all(&frame).await?;
                    io.flush().await
                };
                match tokio::time::timeout(grace, write).await {
                    Ok(res) => {
                        res?;
                        Ok(frame_len)
                    }
                    Err(_) => {
                        slog::error!(self.logger, "meta channel send expired, tearing down");
                        Err(SendError::Timeout)
                    }
                }
            }
        }
    }
}

pub struct FramedReceiver {
    io: Box<dyn AsyncRead + Send + Unpin>,
}

impl FramedReceiver {
    pub fn new(io: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        FramedReceiver { io }
    }

    /// Read one whole frame. Returns `RecvError::Closed` on a clean EOF at
    /// a frame boundary.
    pub async fn recv(&mut self) -> Result<(Packet, usize), RecvError> {
        let mut prefix = [0u8; 8];
        match self.io.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(RecvError::Closed),
            Err(e) => return Err(e.into()),
        }

        let mut rd = &prefix[..];
        let magic = rd.get_u32();
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic(magic).into());
        }
        let raw_cmd = rd.get_u16();
        let cmd = Command::from_wire(raw_cmd).ok_or(WireError::UnknownCommand(raw_cmd))?;
        let payload_len = rd.get_u16() as usize;

        let body_len = cmd.header_len() + payload_len;
        let mut body = vec![0u8; body_len];
        self.io.read_exact(&mut body).await?;

        let pkt = Packet::decode(cmd, Bytes::from(body))?;
        Ok((pkt, 8 + body_len))
    }
}

/// Split a byte stream into boxed framed-channel halves.
pub fn split_stream<S>(stream: S) -> (Box<dyn AsyncRead + Send + Unpin>, Box<dyn AsyncWrite + Send + Unpin>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    (Box::new(rd), Box::new(wr))
}
