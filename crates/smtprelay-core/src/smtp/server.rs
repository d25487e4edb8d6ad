//! SMTP listener
//!
//! Accept loop with a semaphore connection cap; one session task per
//! connection. The TLS acceptor is built once at startup from the
//! active configuration; certificate changes need a restart, tenant
//! and policy changes do not.

use crate::delivery::GraphClient;
use crate::ratelimit::RateLimiter;
use crate::smtp::session::Session;
use crate::smtp::tls::create_tls_acceptor;
use crate::store::ConfigStore;
use anyhow::Result;
use smtprelay_common::config::TlsMode;
use smtprelay_common::event::EventLog;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const MAX_CONNECTIONS: usize = 100;

/// The relay service: shared engine state plus the accept loop
pub struct SmtpServer {
    pub(crate) store: Arc<ConfigStore>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) graph: GraphClient,
    pub(crate) events: EventLog,
    pub(crate) tls_acceptor: Option<TlsAcceptor>,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    pub fn new(
        store: Arc<ConfigStore>,
        limiter: Arc<RateLimiter>,
        graph: GraphClient,
        events: EventLog,
    ) -> Self {
        let snapshot = store.snapshot();
        let tls_acceptor = snapshot.service.tls.as_ref().and_then(|tls| {
            match create_tls_acceptor(tls) {
                Ok(acceptor) => {
                    info!(mode = ?snapshot.service.tls_mode(), "TLS configured");
                    Some(acceptor)
                }
                Err(e) => {
                    warn!(error = %e, "failed to initialize TLS, STARTTLS disabled");
                    None
                }
            }
        });

        Self {
            store,
            limiter,
            graph,
            events,
            tls_acceptor,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind the configured address and serve until the task is aborted.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let snapshot = self.store.snapshot();
        let service = &snapshot.service;
        let host = service.server_ip.as_deref().unwrap_or("0.0.0.0");
        let addr = format!("{host}:{}", service.effective_port());
        let listener = TcpListener::bind(&addr).await?;

        let tls_status = match (&self.tls_acceptor, service.tls_mode()) {
            (Some(_), TlsMode::Implicit) => "implicit TLS",
            (Some(_), TlsMode::Starttls) => "STARTTLS enabled",
            (None, _) => "STARTTLS disabled",
        };
        info!(%addr, tenants = snapshot.tenants.len(), "SMTP relay listening ({tls_status})");

        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(peer = %peer_addr, "max connections reached, dropping");
                            continue;
                        }
                    };

                    let session = Session::new(self.clone(), peer_addr);
                    tokio::spawn(async move {
                        if let Err(e) = session.run(stream).await {
                            debug!(peer = %peer_addr, error = %e, "session ended with error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}
