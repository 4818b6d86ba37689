use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgmux::config::ProxyConfig;
use pgmux::credentials::{provider::spawn_reload, CredentialStore};
use pgmux::proxy::Proxy;
use pgmux::server::{build_tls_acceptor, process_socket};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(ProxyConfig::from_env()?);
    info!(
        listen = %config.listen,
        reader = %config.reader,
        writers = config.writers.len(),
        "starting pgmux"
    );

    // initial credential load; an empty set means trust mode
    let provider = config.credential_provider.clone();
    let credentials = Arc::new(CredentialStore::from_passwords(&provider.fetch().await?));
    if credentials.is_empty() {
        warn!("no credentials configured, sessions run in trust mode");
    } else {
        info!(users = credentials.len(), "credential store loaded");
    }

    if let Some(interval) = config.credential_reload_interval {
        spawn_reload(credentials.clone(), provider.clone(), interval);
        info!(interval_secs = interval.as_secs(), "credential auto-reload enabled");
    }

    let (tls_acceptor, cert_signature) = match &config.client_tls {
        Some(tls) => {
            let (acceptor, signature) = build_tls_acceptor(tls)?;
            (Some(acceptor), Some(Arc::new(signature)))
        }
        None => (None, None),
    };

    let proxy = Arc::new(Proxy::new(&config, credentials, cert_signature)?);

    let listener = TcpListener::bind(&config.listen).await?;
    info!(addr = %config.listen, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                info!(peer = %peer, "connection accepted");

                let proxy = proxy.clone();
                let tls_acceptor = tls_acceptor.clone();
                tokio::spawn(async move {
                    if let Err(e) = process_socket(socket, tls_acceptor, proxy).await {
                        error!(peer = %peer, error = %e, "session ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}
