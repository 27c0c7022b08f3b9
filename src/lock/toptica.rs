//! Toptica DLC pro laser controller over its TCP command line.
//!
//! The command line (port 1998) speaks a small Scheme dialect:
//!
//! ```text
//! > (param-ref 'laser1:ctl:wavelength-act)
//! 1550.0123
//! > (param-set! 'laser1:dl:pc:voltage-set 70.5)
//! 0
//! >
//! ```
//!
//! Every command is echoed back, followed by the result and a fresh `> `
//! prompt. `param-set!` answers `0` on success and a negative code otherwise.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::actuator::{LaserActuator, LaserParams};

const PROMPT: &[u8] = b"> ";

/// Wavelength currently set
pub const WAVELENGTH_SET: &str = "laser1:ctl:wavelength-set";
/// Wavelength the laser reports
pub const WAVELENGTH_ACT: &str = "laser1:ctl:wavelength-act";
/// Motor/controller state, `0` when idle
pub const CTL_STATE: &str = "laser1:ctl:state";
/// Piezo voltage setpoint
pub const PIEZO_VOLTAGE: &str = "laser1:dl:pc:voltage-set";

/// How long coarse setting waits for the motor to come to rest
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE_POLL: Duration = Duration::from_millis(100);

/// One command-line session over any byte stream.
pub struct DlcConnection<S> {
    stream: S,
    timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> DlcConnection<S> {
    /// Wrap `stream` and consume the greeting up to the first prompt.
    pub async fn open(stream: S, timeout: Duration) -> Result<Self> {
        let mut conn = Self { stream, timeout };
        let banner = conn.read_until_prompt().await?;
        debug!(banner = %banner.trim(), "DLC pro greeting");
        Ok(conn)
    }

    async fn read_until_prompt(&mut self) -> Result<String> {
        let limit = self.timeout;
        let stream = &mut self.stream;
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        let read = async {
            while !buf.ends_with(PROMPT) {
                let n = stream.read(&mut byte).await?;
                if n == 0 {
                    bail!("DLC pro closed the connection");
                }
                buf.push(byte[0]);
            }
            Ok::<_, anyhow::Error>(())
        };
        timeout(limit, read)
            .await
            .map_err(|_| anyhow!("no prompt from DLC pro within {limit:?}"))??;
        buf.truncate(buf.len() - PROMPT.len());
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send one expression and return its result with the echo removed.
    pub async fn execute(&mut self, expression: &str) -> Result<String> {
        self.stream
            .write_all(format!("{expression}\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        let raw = self.read_until_prompt().await?;
        Ok(strip_echo(&raw, expression))
    }

    /// Read parameter `key`.
    pub async fn param_ref(&mut self, key: &str) -> Result<String> {
        let reply = self.execute(&format!("(param-ref '{key})")).await?;
        Ok(reply.trim_matches('"').to_string())
    }

    /// Read numeric parameter `key`.
    pub async fn param_ref_f64(&mut self, key: &str) -> Result<f64> {
        let reply = self.param_ref(key).await?;
        reply
            .parse()
            .with_context(|| format!("{key}: not a number: {reply:?}"))
    }

    /// Write parameter `key`.
    pub async fn param_set(&mut self, key: &str, value: f64) -> Result<()> {
        let reply = self
            .execute(&format!("(param-set! '{key} {value:.6})"))
            .await?;
        match reply.trim().parse::<i64>() {
            Ok(0) => Ok(()),
            Ok(code) => bail!("{key}: controller refused value {value} (code {code})"),
            Err(_) => bail!("{key}: unexpected reply {reply:?}"),
        }
    }

    /// Recover the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

fn strip_echo(raw: &str, expression: &str) -> String {
    let body = raw.trim_start_matches(['\r', '\n']);
    let body = body.strip_prefix(expression).unwrap_or(body);
    body.trim().to_string()
}

/// Toptica DLC pro (CTL) driven through piezo feedback.
pub struct TopticaDlcPro {
    params: LaserParams,
    address: String,
    port: u16,
    timeout: Duration,
    conn: Option<DlcConnection<TcpStream>>,
    target_nm: f64,
}

impl TopticaDlcPro {
    /// Driver for the controller at `address:port`. Connects on
    /// [`LaserActuator::connect`].
    pub fn new(params: LaserParams, address: impl Into<String>, port: u16) -> Self {
        Self {
            params,
            address: address.into(),
            port,
            timeout: Duration::from_secs(2),
            conn: None,
            target_nm: 0.0,
        }
    }

    /// Per-command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn conn(&mut self) -> Result<&mut DlcConnection<TcpStream>> {
        self.conn
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not connected", self.params.name))
    }

    async fn wait_until_idle(&mut self) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.conn()?.param_ref(CTL_STATE).await? == "0" {
                return Ok(());
            }
            if started.elapsed() > SETTLE_TIMEOUT {
                warn!(laser = %self.params.name, "laser still busy after coarse set, continuing");
                return Ok(());
            }
            sleep(SETTLE_POLL).await;
        }
    }
}

#[async_trait]
impl LaserActuator for TopticaDlcPro {
    fn params(&self) -> &LaserParams {
        &self.params
    }

    fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let stream = timeout(self.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow!("timed out connecting to {addr}"))?
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        let mut conn = DlcConnection::open(stream, self.timeout).await?;

        self.target_nm = conn.param_ref_f64(WAVELENGTH_SET).await?;
        let min = conn.param_ref_f64("laser1:ctl:wavelength-min").await?;
        let max = conn.param_ref_f64("laser1:ctl:wavelength-max").await?;
        info!(
            laser = %self.params.name,
            %addr,
            wavelength_nm = self.target_nm,
            min, max,
            "DLC pro connected"
        );
        self.conn = Some(conn);
        Ok(())
    }

    async fn disconnect(&mut self, reset_feedback: bool) -> Result<()> {
        if reset_feedback {
            let offset = self.params.piezo_offset;
            self.conn()?.param_set(PIEZO_VOLTAGE, offset).await?;
        }
        if let Some(conn) = self.conn.take() {
            let mut stream = conn.into_inner();
            if let Err(e) = stream.shutdown().await {
                debug!(error = %e, "DLC pro socket shutdown failed");
            }
        }
        info!(laser = %self.params.name, reset_feedback, "DLC pro disconnected");
        Ok(())
    }

    async fn set_wavelength_coarse(&mut self, wavelength_nm: f64) -> Result<()> {
        let offset = self.params.piezo_offset;
        self.conn()?.param_set(PIEZO_VOLTAGE, offset).await?;
        self.target_nm = wavelength_nm;
        self.conn()?.param_set(WAVELENGTH_SET, wavelength_nm).await?;
        self.wait_until_idle().await
    }

    async fn correct_offset(&mut self, setpoint_nm: f64, observed_nm: f64) -> Result<()> {
        let target = self.target_nm + setpoint_nm - observed_nm;
        self.set_wavelength_coarse(target).await
    }

    async fn apply_feedback(&mut self, value: f64) -> Result<()> {
        let voltage = self.params.piezo_offset + value;
        self.conn()?.param_set(PIEZO_VOLTAGE, voltage).await
    }
}
