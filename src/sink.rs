use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::listener;
use crate::logger::Logger;
use crate::session::Limits;
use crate::shutdown::Shutdown;
use crate::storage::Storage;
use crate::tls;
use crate::Opt;

/// Everything a listener or worker needs, built once at startup and shared
/// behind an `Arc`. Construction performs all fail-fast validation: save
/// directory, log file, TLS material.
pub struct MailSink {
    pub opt: Opt,
    pub logger: Logger,
    pub limits: Limits,
    pub storage: Storage,
    pub shutdown: Arc<Shutdown>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl MailSink {
    pub fn new(opt: Opt) -> Result<Self> {
        let logger = Logger::new(opt.log_file.clone(), opt.verbose)?;
        let storage = Storage::new(&opt.save_dir)?;

        let tls_acceptor = match (&opt.tls_cert, &opt.tls_key) {
            (Some(cert), Some(key)) => {
                let acceptor = tls::load_acceptor(cert, key)
                    .context("failed to load TLS certificate/key pair")?;
                logger.log(&format!("TLS enabled with certificate {:?}", cert));
                Some(acceptor)
            }
            _ => None,
        };

        Ok(Self {
            limits: Limits::from_opt(&opt),
            logger,
            storage,
            shutdown: Arc::new(Shutdown::new()),
            tls_acceptor,
            opt,
        })
    }

    /// Binds the configured endpoints, serves until shutdown begins, then
    /// waits for every in-flight connection to finish. A port of -1
    /// disables that endpoint; the secure endpoint also needs cert and key.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut servers = Vec::new();

        if self.opt.port != -1 {
            let address = format!("{}:{}", self.opt.bind, self.opt.port);
            let plain = TcpListener::bind(&address)
                .await
                .with_context(|| format!("failed to start plain listener on {}", address))?;
            servers.push(tokio::spawn(listener::serve(plain, None, Arc::clone(&self))));
        }

        if self.opt.secure_port != -1 {
            match &self.tls_acceptor {
                Some(acceptor) => {
                    let address = format!("{}:{}", self.opt.bind, self.opt.secure_port);
                    let secure = TcpListener::bind(&address)
                        .await
                        .with_context(|| format!("failed to start secure listener on {}", address))?;
                    servers.push(tokio::spawn(listener::serve(
                        secure,
                        Some(acceptor.clone()),
                        Arc::clone(&self),
                    )));
                }
                None => {
                    self.logger
                        .log("Secure port configured but no TLS cert/key given, skipping");
                }
            }
        }

        if servers.is_empty() {
            self.logger.log("No listener configured, nothing to do");
            return Ok(());
        }

        for server in servers {
            server.await.context("listener task panicked")?;
        }
        self.shutdown.wait_for_drain(&self.logger).await;
        Ok(())
    }
}
