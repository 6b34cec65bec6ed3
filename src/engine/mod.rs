//! The flow drivers.
//!
//! One driver per transport and role; all four share the counters, the
//! sampler, and (for clients) the pacing loop, and differ only in how
//! they move bytes.

pub mod tcp;
pub mod udp;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::sync::watch;

use crate::config::{FlowConfig, Role, Transport};

/// Run the configured flow to completion.
pub async fn run(config: Arc<FlowConfig>) -> Result<()> {
    match (config.transport, config.role) {
        (Transport::Tcp, Role::Server) => tcp::run_server(config).await,
        (Transport::Tcp, Role::Client) => tcp::run_client(config).await,
        (Transport::Udp, Role::Server) => udp::run_server(config).await,
        (Transport::Udp, Role::Client) => udp::run_client(config).await,
    }
}

/// User-interrupt flag.
///
/// The drivers poll it between I/O steps and map it onto their
/// teardown path: clients run the forced-close handshake, servers end
/// the accept loop.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    _tx: Option<Arc<watch::Sender<bool>>>,
}

impl Shutdown {
    /// Install the Ctrl-C hook; the returned handle flips once the
    /// signal arrives.
    pub fn listen() -> Self {
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(true);
            }
        });

        Self { rx, _tx: None }
    }

    /// A handle that never fires, for scripted runs.
    pub fn disarmed() -> Self {
        let (tx, rx) = watch::channel(false);

        Self {
            rx,
            _tx: Some(Arc::new(tx)),
        }
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the interrupt.
    pub async fn raised(&mut self) {
        if self.rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wall-clock seconds since the epoch, for the summary window.
pub(crate) fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}

/// Wall-clock microseconds since the epoch, the timestamp base of the
/// datagram protocol.
pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or(0)
}
