//! One-shot command channels.
//!
//! Every admin exchange is a fresh TCP connection: connect, write one
//! frame, read one confirmation byte, close. Listeners get the same
//! wrapper around an accepted stream. All reads and writes sit behind
//! timeouts so a dead peer costs bounded time, never a hung task.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use hlo_core::{HaloError, Result};

use crate::protocol::{AdminMessage, CommandKind, Confirmation, MAX_PAYLOAD};

/// Timeouts applied to a command channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time allowed to establish the TCP connection.
    pub connect_timeout: Duration,
    /// Time allowed for a single frame read or write.
    pub io_timeout: Duration,
    /// Time allowed for the peer to execute and confirm a command.
    /// Longer than `io_timeout` because transfers run before the reply.
    pub confirm_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(2),
            confirm_timeout: Duration::from_secs(10),
        }
    }
}

/// A connected command channel, either dialed or accepted.
pub struct CommandChannel {
    stream: TcpStream,
    config: ChannelConfig,
}

impl CommandChannel {
    /// Dial a peer.
    ///
    /// # Errors
    ///
    /// `Timeout` when the connection does not establish in time, `Io`
    /// when it is refused or breaks.
    pub async fn connect(addr: SocketAddr, config: ChannelConfig) -> Result<Self> {
        match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(Self { stream, config })
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HaloError::Timeout("connect")),
        }
    }

    /// Wrap an accepted connection.
    #[must_use]
    pub fn from_stream(stream: TcpStream, config: ChannelConfig) -> Self {
        Self { stream, config }
    }

    /// Write one command frame.
    pub async fn send(&mut self, message: &AdminMessage) -> Result<()> {
        let frame = message.encode();
        match tokio::time::timeout(self.config.io_timeout, self.stream.write_all(&frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HaloError::Timeout("frame write")),
        }
    }

    /// Read one command frame: status byte, then the payload the kind
    /// demands.
    ///
    /// # Errors
    ///
    /// `Protocol` on an unknown status byte or an over-long length
    /// field, `Timeout`/`Io` on transport trouble.
    pub async fn read_message(&mut self) -> Result<AdminMessage> {
        let status = self.read_bytes::<1>("status byte").await?[0];
        let kind = CommandKind::from_u8(status)
            .ok_or_else(|| HaloError::Protocol(format!("unknown status byte 0x{status:02X}")))?;
        if !kind.has_payload() {
            return AdminMessage::from_parts(kind, None);
        }
        let len = u32::from_be_bytes(self.read_bytes::<4>("payload length").await?) as usize;
        if len > MAX_PAYLOAD {
            return Err(HaloError::Protocol(format!(
                "payload length {len} exceeds limit {MAX_PAYLOAD}"
            )));
        }
        let mut payload = vec![0u8; len];
        match tokio::time::timeout(self.config.io_timeout, self.stream.read_exact(&mut payload))
            .await
        {
            Ok(Ok(_)) => AdminMessage::from_parts(kind, Some(&payload)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HaloError::Timeout("payload read")),
        }
    }

    /// Read the single confirmation byte for a previously sent command.
    pub async fn read_confirmation(&mut self) -> Result<Confirmation> {
        let raw = match tokio::time::timeout(self.config.confirm_timeout, async {
            let mut byte = [0u8; 1];
            self.stream.read_exact(&mut byte).await.map(|_| byte[0])
        })
        .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(HaloError::Timeout("confirmation")),
        };
        Confirmation::from_u8(raw)
            .ok_or_else(|| HaloError::Protocol(format!("invalid confirmation byte 0x{raw:02X}")))
    }

    /// Write the confirmation byte for a command just executed.
    pub async fn send_confirmation(&mut self, confirmation: Confirmation) -> Result<()> {
        let byte = [confirmation as u8];
        match tokio::time::timeout(self.config.io_timeout, self.stream.write_all(&byte)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HaloError::Timeout("confirmation write")),
        }
    }

    async fn read_bytes<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        match tokio::time::timeout(self.config.io_timeout, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(HaloError::Timeout(what)),
        }
    }
}

/// Dial `addr`, send one command, await its confirmation.
///
/// # Errors
///
/// Propagates connect, transport and protocol failures; a `Rejected`
/// confirmation is a successful exchange and is returned as `Ok`.
pub async fn dispatch_command(
    addr: SocketAddr,
    message: &AdminMessage,
    config: &ChannelConfig,
) -> Result<Confirmation> {
    let mut channel = CommandChannel::connect(addr, config.clone()).await?;
    channel.send(message).await?;
    let confirmation = channel.read_confirmation().await?;
    debug!(
        target: "halo::net",
        peer = %addr,
        kind = ?message.kind(),
        confirmation = ?confirmation,
        "Command dispatched"
    );
    Ok(confirmation)
}

/// Dial `addr` and send one command without waiting for any reply.
/// Used for fire-and-forget traffic: failure reports and crash orders.
pub async fn send_report(
    addr: SocketAddr,
    message: &AdminMessage,
    config: &ChannelConfig,
) -> Result<()> {
    let mut channel = CommandChannel::connect(addr, config.clone()).await?;
    channel.send(message).await?;
    debug!(
        target: "halo::net",
        peer = %addr,
        kind = ?message.kind(),
        "Report sent"
    );
    Ok(())
}
