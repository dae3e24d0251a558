//! A single authenticated IMAP connection, grounded on the teacher's
//! `mail::providers::imap::connection::ImapConnection`: a staleness check so
//! the gateway knows when to reconnect, and connect/authenticate split into
//! two steps so retries can re-run just the half that failed.

use crate::config::AccountConfig;
use crate::error::ImapError;
use async_imap::Session;
use secrecy::ExposeSecret;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{info, instrument, warn};

/// Connections idle longer than this are treated as stale and reconnected
/// rather than reused, matching the teacher's 5-minute threshold.
const STALE_AFTER: Duration = Duration::from_secs(5 * 60);

type ImapStream = Compat<async_native_tls::TlsStream<TcpStream>>;

/// One live connection to an account's IMAP server, plus enough state to
/// decide when it needs replacing.
pub struct ImapConnection {
    session: Session<ImapStream>,
    last_used: Instant,
}

impl ImapConnection {
    #[instrument(skip(config), fields(host = %config.imap_host))]
    pub async fn connect(config: &AccountConfig) -> Result<Self, ImapError> {
        let addr = (config.imap_host.as_str(), config.imap_port);
        let tcp = TcpStream::connect(addr).await.map_err(|e| ImapError::connection(format!("tcp connect failed: {e}")))?;

        let tls_stream = build_tls_connector(config)
            .connect(&config.imap_host, tcp)
            .await
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = authenticate(client, config).await?;

        info!("connected to {}:{}", config.imap_host, config.imap_port);
        Ok(Self { session, last_used: Instant::now() })
    }

    pub fn is_stale(&self) -> bool {
        self.last_used.elapsed() > STALE_AFTER
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn session_mut(&mut self) -> &mut Session<ImapStream> {
        self.touch();
        &mut self.session
    }

    pub async fn close(mut self) -> Result<(), ImapError> {
        self.session.logout().await.map_err(ImapError::Protocol)
    }
}

fn build_tls_connector(config: &AccountConfig) -> async_native_tls::TlsConnector {
    let mut tls = async_native_tls::TlsConnector::new();
    if config.imap_insecure {
        warn!("TLS certificate verification disabled for {}", config.imap_host);
        tls = tls.danger_accept_invalid_certs(true).danger_accept_invalid_hostnames(true);
    } else if config.imap_ssl_trust.as_deref() == Some(config.imap_host.as_str()) {
        // `ssl_trust` names one specific host to trust past hostname
        // mismatches (e.g. a self-signed cert presented under an internal
        // name); the certificate chain itself is still verified.
        warn!("trusting hostname mismatch for named host {}", config.imap_host);
        tls = tls.danger_accept_invalid_hostnames(true);
    }
    tls
}

async fn authenticate(client: async_imap::Client<ImapStream>, config: &AccountConfig) -> Result<Session<ImapStream>, ImapError> {
    client
        .login(&config.imap_user, config.imap_pass.expose_secret())
        .await
        .map_err(|(error, _client)| ImapError::authentication(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_is_five_minutes() {
        assert_eq!(STALE_AFTER, Duration::from_secs(300));
    }
}
