//! Scalar and array exchange run by the two roles.
//!
//! Two-way: the server sends its float into the client's pre-posted
//! receive, the client answers with its own, the client streams its array
//! (count first), then the server streams its array back. One-way: the
//! client sends its float and its array; the server only receives.

use std::net::SocketAddrV4;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{CommMode, SessionConfig};
use crate::connector::ClientSession;
use crate::context::Role;
use crate::error::{Result, SessionError};
use crate::exchange::{Exchange, FabricEndpoint, PendingRecv, TransferReport, WireScalar};
use crate::listener::Listener;

/// Default cap on a peer-declared element count.
pub const DEFAULT_MAX_ELEMENTS: usize = 4 * 1024 * 1024;

/// Values each role sends.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoConfig {
    pub server_value: f32,
    pub client_value: f32,
    /// Elements in each side's array.
    pub element_count: usize,
    /// Value every array element carries.
    pub element_value: f32,
    /// Largest element count accepted from the peer.
    pub max_elements: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            server_value: 123.45,
            client_value: 678.90,
            element_count: 70,
            element_value: 35.6,
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }
}

impl DemoConfig {
    pub fn with_element_count(mut self, count: usize) -> Self {
        self.element_count = count;
        self
    }

    fn elements(&self) -> Vec<f32> {
        vec![self.element_value; self.element_count]
    }
}

/// What one role sent and received.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub role: Role,
    pub mode: CommMode,
    pub peer: Option<String>,
    pub sent_value: Option<f32>,
    pub received_value: Option<f32>,
    pub sent_elements: usize,
    pub received_elements: usize,
    /// Sum of the received elements.
    pub received_sum: f64,
    #[serde(skip)]
    pub received: Vec<f32>,
    pub transfers: Vec<TransferReport>,
    pub elapsed_ms: f64,
}

impl DemoReport {
    fn new(role: Role, mode: CommMode) -> Self {
        Self {
            role,
            mode,
            peer: None,
            sent_value: None,
            received_value: None,
            sent_elements: 0,
            received_elements: 0,
            received_sum: 0.0,
            received: Vec::new(),
            transfers: Vec::new(),
            elapsed_ms: 0.0,
        }
    }

    fn record_received(&mut self, values: Vec<f32>, transfer: TransferReport) {
        self.received_elements = values.len();
        self.received_sum = values.iter().map(|v| f64::from(*v)).sum();
        self.received = values;
        self.transfers.push(transfer);
    }

    fn record_sent(&mut self, count: usize, transfer: TransferReport) {
        self.sent_elements = count;
        self.transfers.push(transfer);
    }
}

/// Connect to `dest` and run the client side of the exchange.
pub fn run_client(dest: SocketAddrV4, config: &SessionConfig, demo: &DemoConfig) -> Result<DemoReport> {
    let started = Instant::now();
    let mut session = ClientSession::connect(dest, config)?;
    let mut report = DemoReport::new(Role::Client, config.mode);
    report.peer = Some(dest.to_string());

    let preposted = session.take_preposted();
    let exchange = session.exchange_mut();
    match config.mode {
        CommMode::TwoWay => {
            let value = recv_first_scalar(exchange, preposted)?;
            info!(value, "received server value");
            report.received_value = Some(value);
            exchange.send_scalar(demo.client_value)?;
            report.sent_value = Some(demo.client_value);

            let elements = demo.elements();
            report.record_sent(elements.len(), exchange.send_floats(&elements)?);
            let (values, transfer) = exchange.recv_floats(demo.max_elements)?;
            info!(count = values.len(), "received server array");
            report.record_received(values, transfer);
        }
        CommMode::OneWay => {
            exchange.send_scalar(demo.client_value)?;
            report.sent_value = Some(demo.client_value);
            let elements = demo.elements();
            report.record_sent(elements.len(), exchange.send_floats(&elements)?);
        }
    }

    session.close()?;
    report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(elapsed_ms = report.elapsed_ms, "client finished");
    Ok(report)
}

/// Accept one connection on `listener` and run the server side.
pub fn run_server(listener: Listener, demo: &DemoConfig) -> Result<DemoReport> {
    let started = Instant::now();
    let mode = listener.mode();
    let mut session = listener.accept()?;
    let mut report = DemoReport::new(Role::Server, mode);
    report.peer = session.peer().map(|peer| peer.to_string());

    let preposted = session.take_preposted();
    let exchange = session.exchange_mut();
    match mode {
        CommMode::TwoWay => {
            exchange.send_scalar(demo.server_value)?;
            report.sent_value = Some(demo.server_value);
            let value = recv_first_scalar(exchange, preposted)?;
            info!(value, "received client value");
            report.received_value = Some(value);

            let (values, transfer) = exchange.recv_floats(demo.max_elements)?;
            info!(count = values.len(), "received client array");
            report.record_received(values, transfer);
            let elements = demo.elements();
            report.record_sent(elements.len(), exchange.send_floats(&elements)?);
        }
        CommMode::OneWay => {
            let value = recv_first_scalar(exchange, preposted)?;
            info!(value, "received client value");
            report.received_value = Some(value);
            let (values, transfer) = exchange.recv_floats(demo.max_elements)?;
            info!(count = values.len(), "received client array");
            report.record_received(values, transfer);
        }
    }

    session.close()?;
    report.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(elapsed_ms = report.elapsed_ms, "server finished");
    Ok(report)
}

/// Complete the first float through the pre-posted receive, or post one
/// when nothing was pre-posted.
fn recv_first_scalar(
    exchange: &mut Exchange<FabricEndpoint>,
    preposted: Option<PendingRecv>,
) -> Result<f32> {
    let pending = match preposted {
        Some(pending) if pending.len() == f32::WIDTH => pending,
        Some(pending) => {
            return Err(SessionError::protocol(format!(
                "pre-posted receive holds {} bytes, expected {}",
                pending.len(),
                f32::WIDTH
            )))
        }
        None => exchange.post_scalar_recv::<f32>()?,
    };
    exchange.complete_recv(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let demo = DemoConfig::default();
        assert_eq!(demo.server_value, 123.45);
        assert_eq!(demo.client_value, 678.90);
        assert_eq!(demo.elements().len(), 70);
        assert!(demo.elements().iter().all(|v| *v == 35.6));
    }

    #[test]
    fn report_serializes_without_raw_elements() {
        let mut report = DemoReport::new(Role::Server, CommMode::TwoWay);
        report.record_received(
            vec![1.0, 2.0],
            TransferReport {
                direction: crate::exchange::Direction::Recv,
                bytes: 8,
                chunks: 1,
                busy_retries: 0,
            },
        );
        let json = serde_json::to_value(&report).expect("report should serialize");
        assert_eq!(json["role"], "server");
        assert_eq!(json["mode"], "two-way");
        assert_eq!(json["received_elements"], 2);
        assert_eq!(json["received_sum"], 3.0);
        assert!(json.get("received").is_none());
        assert_eq!(json["transfers"][0]["direction"], "recv");
    }
}
