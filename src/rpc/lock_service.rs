//! Remote surface of a laser lock.
//!
//! | method                    | params       | result |
//! |---------------------------|--------------|--------|
//! | `set_wavelength_setpoint` | `wavelength` | `true` |
//! | `get_wavelength_setpoint` |              | nm     |
//! | `set_detuning`            | `detuning`   | `true` |
//! | `get_detuning`            |              | GHz    |
//! | `change_detuning`         | `detuning`   | new setpoint (nm) |
//! | `remote_start`            |              | `true` |
//! | `remote_pause`            |              | `true` |
//! | `remote_stop`             |              | `true` |
//! | `get_wavelength`          |              | nm or `null` |
//! | `snapshot`                |              | `{current_wavelength, wavelength_setpoint, detuning, running}` |
//! | `get_is_running`          |              | bool   |
//! | `samples`                 |              | `[sample]` |

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use super::{parse_params, to_result, RpcFault, RpcService};
use crate::lock::LaserLock;

#[derive(Deserialize)]
struct WavelengthParams {
    wavelength: f64,
}

#[derive(Deserialize)]
struct DetuningParams {
    detuning: f64,
}

/// Exposes a [`LaserLock`] over RPC.
pub struct LaserLockService {
    lock: Arc<LaserLock>,
}

impl LaserLockService {
    /// Serve `lock`
    pub fn new(lock: Arc<LaserLock>) -> Self {
        Self { lock }
    }
}

#[async_trait]
impl RpcService for LaserLockService {
    fn name(&self) -> &str {
        "laser_lock"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcFault> {
        match method {
            "set_wavelength_setpoint" => {
                let p: WavelengthParams = parse_params(params)?;
                self.lock.set_wavelength_setpoint(p.wavelength);
                to_result(true)
            }
            "get_wavelength_setpoint" => to_result(self.lock.get_wavelength_setpoint()),
            "set_detuning" => {
                let p: DetuningParams = parse_params(params)?;
                self.lock.set_detuning(p.detuning);
                to_result(true)
            }
            "get_detuning" => to_result(self.lock.get_detuning()),
            "change_detuning" => {
                let p: DetuningParams = parse_params(params)?;
                to_result(self.lock.change_detuning(p.detuning).await?)
            }
            "remote_start" => {
                self.lock.remote_start().await?;
                to_result(true)
            }
            "remote_pause" => {
                self.lock.remote_pause().await?;
                to_result(true)
            }
            "remote_stop" => {
                self.lock.remote_stop().await?;
                to_result(true)
            }
            "get_wavelength" => to_result(self.lock.get_wavelength()),
            "snapshot" => to_result(self.lock.snapshot()),
            "get_is_running" => to_result(self.lock.get_is_running()),
            "samples" => to_result(self.lock.samples()),
            other => Err(RpcFault::method_not_found(other)),
        }
    }
}
