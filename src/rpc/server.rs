//! TCP listener serving one [`RpcService`].

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{tcp::OwnedWriteHalf, TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{RpcFault, RpcRequest, RpcResponse, RpcService};

/// Accepts connections and serves each on its own task.
pub struct RpcServer {
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    /// Cancellation token for graceful shutdown.
    cancel: CancellationToken,
}

impl RpcServer {
    /// Bind `addr`. Use port 0 to let the OS choose.
    pub async fn bind(
        addr: &str,
        service: Arc<dyn RpcService>,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            service,
            cancel,
        })
    }

    /// Address actually bound
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until cancelled.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(
            service = self.service.name(),
            addr = %self.listener.local_addr()?,
            "rpc server listening"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&self.service);
                            let cancel = self.cancel.child_token();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, service, cancel).await {
                                    tracing::debug!(%peer, error = %e, "connection finished with error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!(service = self.service.name(), "rpc server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> JoinHandle<std::io::Result<()>> {
        tokio::spawn(self.run())
    }
}

async fn handle_connection(
    stream: TcpStream,
    service: Arc<dyn RpcService>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    tracing::debug!(service = service.name(), "client connected");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let Some(line) = line else {
            tracing::debug!("client disconnected (EOF)");
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => {
                tracing::debug!(method = %req.method, id = ?req.id, "request received");
                let outcome = tokio::select! {
                    outcome = service.dispatch(&req.method, req.params) => outcome,
                    _ = cancel.cancelled() => return Ok(()),
                };
                match outcome {
                    Ok(result) => RpcResponse {
                        id: req.id,
                        result: Some(result),
                        error: None,
                    },
                    Err(fault) => {
                        tracing::debug!(method = %req.method, kind = %fault.kind, "request failed");
                        RpcResponse {
                            id: req.id,
                            result: None,
                            error: Some(fault),
                        }
                    }
                }
            }
            Err(e) => RpcResponse {
                id: None,
                result: None,
                error: Some(RpcFault::parse_error(format!("parse error: {e}"))),
            },
        };
        write_json(&mut writer, &response).await?;
    }
}

async fn write_json(writer: &mut OwnedWriteHalf, value: &RpcResponse) -> std::io::Result<()> {
    let mut buf = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}
