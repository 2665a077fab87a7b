//! Transport links that deliver envelopes between two hosts.
//!
//! A [`Link`] sends channel-tagged envelopes to its peer; inbound traffic is
//! delivered on an unbounded receiver of [`LinkEvent`]s. A link preserves
//! send order, never retries, and reports loss of the peer exactly once as
//! [`LinkEvent::Disconnected`].
//!
//! Two implementations:
//!
//! - [`MemoryLink`]: an in-process pair, still passing every envelope through
//!   the codec so both ends see exactly what a wire would carry.
//! - [`TcpLink`]: length-prefixed JSON frames over TCP, opened by an
//!   HMAC-authenticated handshake ([`TcpLink::connect`] / [`LinkListener`]).

use crate::message::*;

use devlink_types::config::LinkConfig;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Errors from the link layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

/// Something that happened on a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// An envelope arrived on `channel`.
    Envelope { channel: Channel, envelope: Envelope },
    /// The peer is gone. Emitted once; nothing follows it.
    Disconnected,
}

/// Receiving half of a link.
pub type Inbound = mpsc::UnboundedReceiver<LinkEvent>;

/// Sending half of a link.
///
/// `send` never blocks, so resources may emit events from their own threads.
pub trait Link: Send + Sync + 'static {
    /// Queue `envelope` for delivery on `channel`.
    fn send(&self, channel: Channel, envelope: &Envelope) -> Result<(), LinkError>;

    /// Tear the link down. Both ends observe [`LinkEvent::Disconnected`].
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Generate HMAC-SHA256 signature for handshake authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

// ---------------------------------------------------------------------------
// In-memory link
// ---------------------------------------------------------------------------

/// One end of an in-process link pair.
pub struct MemoryLink {
    peer: mpsc::UnboundedSender<LinkEvent>,
    own: mpsc::UnboundedSender<LinkEvent>,
    open: Arc<AtomicBool>,
}

impl MemoryLink {
    /// Create two connected ends.
    pub fn pair() -> ((Arc<MemoryLink>, Inbound), (Arc<MemoryLink>, Inbound)) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let a = MemoryLink {
            peer: b_tx.clone(),
            own: a_tx.clone(),
            open: open.clone(),
        };
        let b = MemoryLink {
            peer: a_tx,
            own: b_tx,
            open,
        };
        ((Arc::new(a), a_rx), (Arc::new(b), b_rx))
    }
}

impl Link for MemoryLink {
    fn send(&self, channel: Channel, envelope: &Envelope) -> Result<(), LinkError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(LinkError::ConnectionClosed);
        }
        let bytes = encode(envelope)?;
        match decode(&bytes) {
            Ok(envelope) => self
                .peer
                .send(LinkEvent::Envelope { channel, envelope })
                .map_err(|_| LinkError::ConnectionClosed),
            Err(e) => {
                warn!(error = %e, "Dropping envelope that does not survive the codec");
                Ok(())
            }
        }
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.peer.send(LinkEvent::Disconnected);
            let _ = self.own.send(LinkEvent::Disconnected);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// TCP link
// ---------------------------------------------------------------------------

enum Outgoing {
    Frame(Vec<u8>),
    Shutdown,
}

/// A framed, authenticated TCP link.
pub struct TcpLink {
    outbound: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
    peer_node_id: String,
    remote_addr: SocketAddr,
    max_frame_size: u32,
}

impl TcpLink {
    /// Connect to `config.connect_addr` and perform the client handshake.
    pub async fn connect(config: &LinkConfig) -> Result<(Arc<TcpLink>, Inbound), LinkError> {
        if config.shared_secret.is_empty() {
            return Err(LinkError::HandshakeFailed(
                "devlink requires shared_secret. Set [link] shared_secret in config.toml".into(),
            ));
        }
        info!("devlink: connecting to {}", config.connect_addr);
        let mut stream = TcpStream::connect(&config.connect_addr).await?;
        let remote_addr = stream.peer_addr()?;

        let nonce = uuid::Uuid::new_v4().to_string();
        let auth_data = format!("{}{}", nonce, config.node_id);
        let hello = Handshake::Hello {
            node_id: config.node_id.clone(),
            node_name: config.node_name.clone(),
            protocol_version: PROTOCOL_VERSION,
            auth_hmac: hmac_sign(&config.shared_secret, auth_data.as_bytes()),
            nonce,
        };
        write_framed(&mut stream, &hello).await?;

        let body = read_handshake(&mut stream, config).await?;
        let response: Handshake = serde_json::from_slice(&body).map_err(CodecError::Decode)?;
        let peer_node_id = match response {
            Handshake::HelloAck {
                node_id,
                node_name,
                protocol_version,
                nonce,
                auth_hmac,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(LinkError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                let expected = format!("{}{}", nonce, node_id);
                if !hmac_verify(&config.shared_secret, expected.as_bytes(), &auth_hmac) {
                    return Err(LinkError::HandshakeFailed(
                        "HMAC verification failed on HelloAck".into(),
                    ));
                }
                info!(
                    "devlink: handshake complete with {} ({}) at {}",
                    node_name, node_id, remote_addr
                );
                node_id
            }
            Handshake::Rejected { code, message } => {
                return Err(LinkError::HandshakeFailed(format!(
                    "Remote error {code}: {message}"
                )));
            }
            Handshake::Hello { .. } => {
                return Err(LinkError::HandshakeFailed(
                    "Unexpected response to hello".to_string(),
                ));
            }
        };

        Ok(Self::spawn(
            stream,
            peer_node_id,
            remote_addr,
            config.max_frame_size,
        ))
    }

    /// Start the reader and writer tasks for an authenticated stream.
    fn spawn(
        stream: TcpStream,
        peer_node_id: String,
        remote_addr: SocketAddr,
        max_frame_size: u32,
    ) -> (Arc<TcpLink>, Inbound) {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                match item {
                    Outgoing::Frame(bytes) => {
                        if let Err(e) = write_all_flush(&mut writer, &bytes).await {
                            debug!("devlink: write to {} failed: {}", remote_addr, e);
                            break;
                        }
                    }
                    Outgoing::Shutdown => break,
                }
            }
            writer_open.store(false, Ordering::Release);
            let _ = writer.shutdown().await;
        });

        let reader_open = open.clone();
        let reader_out = out_tx.clone();
        let reader_peer = peer_node_id.clone();
        tokio::spawn(async move {
            loop {
                let body = match read_body(&mut reader, max_frame_size).await {
                    Ok(body) => body,
                    Err(LinkError::ConnectionClosed) => break,
                    Err(e) => {
                        debug!("devlink: link to {} ended: {}", reader_peer, e);
                        break;
                    }
                };
                match decode_frame(&body) {
                    Ok(Frame { channel, envelope }) => {
                        if in_tx.send(LinkEvent::Envelope { channel, envelope }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(peer = %reader_peer, error = %e, "Dropping malformed frame");
                    }
                }
            }
            reader_open.store(false, Ordering::Release);
            let _ = reader_out.send(Outgoing::Shutdown);
            let _ = in_tx.send(LinkEvent::Disconnected);
        });

        let link = Arc::new(TcpLink {
            outbound: out_tx,
            open,
            peer_node_id,
            remote_addr,
            max_frame_size,
        });
        (link, in_rx)
    }

    pub fn peer_node_id(&self) -> &str {
        &self.peer_node_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl Link for TcpLink {
    fn send(&self, channel: Channel, envelope: &Envelope) -> Result<(), LinkError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(LinkError::ConnectionClosed);
        }
        let bytes = encode_frame(channel, envelope)?;
        let size = (bytes.len() - 4) as u32;
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            }
            .into());
        }
        self.outbound
            .send(Outgoing::Frame(bytes))
            .map_err(|_| LinkError::ConnectionClosed)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outgoing::Shutdown);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Accepts inbound TCP links.
pub struct LinkListener {
    listener: TcpListener,
    config: LinkConfig,
    local_addr: SocketAddr,
}

impl LinkListener {
    /// Bind `config.listen_addr`.
    pub async fn bind(config: LinkConfig) -> Result<Self, LinkError> {
        // SECURITY: Require shared_secret for TCP links
        if config.shared_secret.is_empty() {
            return Err(LinkError::HandshakeFailed(
                "devlink requires shared_secret. Set [link] shared_secret in config.toml".into(),
            ));
        }
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "devlink: listening on {} (node_id={})",
            local_addr, config.node_id
        );
        Ok(Self {
            listener,
            config,
            local_addr,
        })
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Wait for the next TCP connection, without authenticating it.
    pub async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr), LinkError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("devlink: accepted connection from {}", addr);
        Ok((stream, addr))
    }

    /// Wait for the next connection and run the server handshake on it.
    ///
    /// An `Err` concerns only that connection; keep accepting.
    pub async fn accept(&self) -> Result<(Arc<TcpLink>, Inbound), LinkError> {
        let (stream, addr) = self.accept_stream().await?;
        TcpLink::accept_handshake(&self.config, stream, addr).await
    }
}

impl TcpLink {
    /// Server half of the handshake on a freshly accepted stream.
    pub async fn accept_handshake(
        config: &LinkConfig,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(Arc<TcpLink>, Inbound), LinkError> {
        let body = read_handshake(&mut stream, config).await?;
        let msg = serde_json::from_slice::<Handshake>(&body).ok();
        let peer_node_id = match msg {
            Some(Handshake::Hello {
                node_id,
                node_name,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    let reject = Handshake::Rejected {
                        code: 1,
                        message: format!(
                            "Protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    };
                    write_framed(&mut stream, &reject).await?;
                    return Err(LinkError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }

                // SECURITY: Verify the incoming HMAC
                let expected = format!("{}{}", nonce, node_id);
                if !hmac_verify(&config.shared_secret, expected.as_bytes(), &auth_hmac) {
                    let reject = Handshake::Rejected {
                        code: 403,
                        message: "HMAC authentication failed".to_string(),
                    };
                    write_framed(&mut stream, &reject).await?;
                    return Err(LinkError::HandshakeFailed(
                        "HMAC verification failed on incoming hello".into(),
                    ));
                }

                let ack_nonce = uuid::Uuid::new_v4().to_string();
                let ack_data = format!("{}{}", ack_nonce, config.node_id);
                let ack = Handshake::HelloAck {
                    node_id: config.node_id.clone(),
                    node_name: config.node_name.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    auth_hmac: hmac_sign(&config.shared_secret, ack_data.as_bytes()),
                    nonce: ack_nonce,
                };
                write_framed(&mut stream, &ack).await?;
                info!("devlink: handshake with {} ({}) from {}", node_name, node_id, addr);
                node_id
            }
            // SECURITY: nothing is dispatched before an authenticated hello
            _ => {
                warn!(
                    "devlink: rejected unauthenticated message from {}; hello required",
                    addr
                );
                let reject = Handshake::Rejected {
                    code: 401,
                    message: "Authentication required: complete HMAC handshake first".to_string(),
                };
                write_framed(&mut stream, &reject).await?;
                return Err(LinkError::HandshakeFailed(
                    "Rejected unauthenticated connection".into(),
                ));
            }
        };

        Ok(TcpLink::spawn(
            stream,
            peer_node_id,
            addr,
            config.max_frame_size,
        ))
    }
}

async fn write_all_flush<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), LinkError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a framed message (4-byte length + JSON).
pub async fn write_framed<W, T>(writer: &mut W, msg: &T) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let bytes = encode_framed(msg)?;
    write_all_flush(writer, &bytes).await
}

/// Read one frame body (4-byte length + JSON), without parsing it.
pub async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> Result<Vec<u8>, LinkError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(LinkError::ConnectionClosed);
        }
        Err(e) => return Err(LinkError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        }
        .into());
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read one handshake frame, giving up after the configured deadline.
async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &LinkConfig,
) -> Result<Vec<u8>, LinkError> {
    let deadline = config.handshake_timeout();
    match tokio::time::timeout(deadline, read_body(reader, config.max_frame_size)).await {
        Ok(body) => body,
        Err(_) => Err(LinkError::HandshakeFailed(format!(
            "no handshake frame within {}ms",
            deadline.as_millis()
        ))),
    }
}
