//! Scripted adapter for driver tests.

use super::Adapter;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct Script {
    replies: VecDeque<Vec<u8>>,
    pending: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    connected: bool,
    connects: u32,
}

/// Adapter that answers each write with the next queued reply.
///
/// Clones share the same script, so a test can keep a handle to inspect what
/// the driver wrote.
#[derive(Clone, Default)]
pub struct MockAdapter {
    script: Arc<Mutex<Script>>,
}

impl MockAdapter {
    /// A connected adapter with no replies queued.
    pub fn new() -> Self {
        let adapter = Self::default();
        adapter.lock().connected = true;
        adapter
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue the bytes returned after the next write. An empty reply simulates
    /// a silent device.
    pub fn push_reply(&self, reply: impl Into<Vec<u8>>) {
        self.lock().replies.push_back(reply.into());
    }

    /// Every frame written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> u32 {
        self.lock().connects
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut script = self.lock();
        if !script.connected {
            return Err(anyhow!("mock port closed"));
        }
        script.written.push(bytes.to_vec());
        script.pending.clear();
        if let Some(reply) = script.replies.pop_front() {
            script.pending.extend(reply);
        }
        Ok(())
    }

    async fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut script = self.lock();
        let n = buffer.len().min(script.pending.len());
        for (slot, byte) in buffer.iter_mut().zip(script.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn connect(&mut self) -> Result<()> {
        let mut script = self.lock();
        script.connected = true;
        script.connects += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock().connected = false;
        Ok(())
    }
}
