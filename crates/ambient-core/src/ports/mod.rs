//! Port pool for local runner processes.
//!
//! Ports are handed out from a fixed range, one per session. A candidate is
//! only assigned after an actual bind-and-release probe succeeds, so ports
//! taken by unrelated processes on the host are skipped rather than
//! double-booked.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};

use parking_lot::Mutex;

use crate::error::ProcessError;

#[derive(Debug, Default)]
struct Assignments {
    by_port: HashMap<u16, String>,
    by_session: HashMap<String, u16>,
}

/// Bijection between ports in `[start, end]` and session ids.
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    end: u16,
    inner: Mutex<Assignments>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            inner: Mutex::new(Assignments::default()),
        }
    }

    /// Assign a port to `session_id`. Idempotent: a session that already
    /// holds a port gets the same one back.
    pub fn allocate(&self, session_id: &str) -> Result<u16, ProcessError> {
        let mut inner = self.inner.lock();
        if let Some(port) = inner.by_session.get(session_id) {
            return Ok(*port);
        }

        for port in self.start..=self.end {
            if inner.by_port.contains_key(&port) {
                continue;
            }
            if !is_port_free(port) {
                tracing::debug!(port, "Port in use outside the pool, skipping");
                continue;
            }
            inner.by_port.insert(port, session_id.to_string());
            inner.by_session.insert(session_id.to_string(), port);
            tracing::debug!(port, session_id, "Port allocated");
            return Ok(port);
        }

        Err(ProcessError::PortPoolExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Free the session's port, if it holds one.
    pub fn release(&self, session_id: &str) -> Option<u16> {
        let mut inner = self.inner.lock();
        let port = inner.by_session.remove(session_id)?;
        inner.by_port.remove(&port);
        tracing::debug!(port, session_id, "Port released");
        Some(port)
    }

    pub fn port_of(&self, session_id: &str) -> Option<u16> {
        self.inner.lock().by_session.get(session_id).copied()
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().by_port.len()
    }
}

fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
