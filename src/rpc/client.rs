//! Client side of the RPC protocol.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use super::{RpcRequest, RpcResponse};
use crate::error::{AppResult, WlmError};

/// One connection to an RPC server. Calls are sequential.
pub struct RpcClient {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl RpcClient {
    /// Connect to `addr` (`host:port`).
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            reader: BufReader::new(reader),
            writer,
            next_id: 1,
        })
    }

    /// Server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Call `method` and decode its result.
    ///
    /// # Errors
    ///
    /// `Disconnected` or `Io` when the transport fails, the rebuilt server
    /// error when the method failed, `Json` when the result has another shape.
    pub async fn call<T: DeserializeOwned>(&mut self, method: &str, params: Value) -> AppResult<T> {
        let id = self.next_id;
        self.next_id += 1;

        let request = RpcRequest {
            id: Some(id),
            method: method.to_string(),
            params,
        };
        let mut buf = serde_json::to_vec(&request)?;
        buf.push(b'\n');
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;

        // Replies to earlier requests whose caller went away are still in
        // the stream; they carry lower ids.
        let mut line = String::new();
        let response = loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(WlmError::Disconnected(self.addr.clone()));
            }
            let response: RpcResponse = serde_json::from_str(&line)?;
            match response.id {
                Some(rid) if rid < id => {
                    debug!(stale = rid, current = id, "skipping reply to an abandoned request");
                }
                Some(rid) if rid != id => {
                    return Err(WlmError::Rpc(format!(
                        "response id {rid} does not match request {id}"
                    )));
                }
                _ => break response,
            }
        };
        if let Some(fault) = response.error {
            return Err(fault.into_error());
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}
