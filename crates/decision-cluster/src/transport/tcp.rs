//! # tcp
//!
//! why: carry transport requests between agent processes
//! relations: implements the Transport trait from mod.rs, serves into any RequestHandler
//! what: frame codec (write_frame/read_frame), TcpTransport client, serve() accept loop
//!
//! Each frame is a big-endian `u32` byte count followed by one JSON document.
//! A client opens a connection per request; the server answers every frame
//! it reads on a connection until the client hangs up.

use std::sync::Arc;

use async_trait::async_trait;
use decision_core::NodeId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Request, RequestHandler, Response, Transport};
use crate::error::TransportError;

/// Upper bound on a single frame; a full AppendEntries batch fits comfortably.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` on a clean end of stream before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Client half: dials the target address for every request.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        target: NodeId,
        address: &str,
        request: Request,
    ) -> Result<Response, TransportError> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|_| TransportError::Unreachable { node: target })?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &request).await?;
        read_frame(&mut stream).await?.ok_or(TransportError::Closed)
    }
}

/// Accept connections on `listener` and answer each frame through `handler`.
pub fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "listening for peers and clients");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            debug!(%peer_addr, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    })
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
        let response = handler.handle(request).await;
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
