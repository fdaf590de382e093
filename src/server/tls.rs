use std::sync::Arc;

use anyhow::{Result, bail};
use tokio::net::TcpListener;
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        crypto::aws_lc_rs::sign::any_supported_type,
        pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
        server::ResolvesServerCertUsingSni,
        sign::CertifiedKey,
    },
};

use super::{drive, next_conn_id};
use crate::{
    Gateway,
    config::{Bind, Config, Ssl},
};

fn certified_key(ssl: &Ssl) -> Result<CertifiedKey> {
    let certs =
        CertificateDer::pem_file_iter(&ssl.certificate)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(&ssl.key)?;

    Ok(CertifiedKey::new(certs, any_supported_type(&key)?))
}

/// Build the TLS acceptor for one bind point.
///
/// The acceptor's own material (or the global material) serves every vhost;
/// vhosts carrying their own certificate/key are dispatched by SNI instead.
pub(super) fn acceptor(
    config: &Config,
    bind: &Bind,
    vhosts: &[service::vhost::Vhost],
) -> Result<TlsAcceptor> {
    let base = bind.ssl.as_ref().or(config.ssl.as_ref());

    let overrides: Vec<(&str, &Ssl)> = vhosts
        .iter()
        .filter_map(|vhost| {
            config
                .vhost
                .iter()
                .find(|it| it.name == vhost.name())
                .and_then(|it| it.ssl.as_ref())
                .map(|ssl| (vhost.name(), ssl))
        })
        .collect();

    let server = if overrides.is_empty() {
        let Some(ssl) = base else {
            bail!("you have not specified a valid SSL certificate");
        };

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                CertificateDer::pem_file_iter(&ssl.certificate)?
                    .collect::<Result<Vec<_>, _>>()?,
                PrivateKeyDer::from_pem_file(&ssl.key)?,
            )?
    } else {
        let mut resolver = ResolvesServerCertUsingSni::new();

        for (name, ssl) in &overrides {
            resolver.add(name, certified_key(ssl)?)?;
        }

        // hosts without their own material still need a certificate
        for vhost in vhosts {
            if overrides.iter().any(|(name, _)| *name == vhost.name()) {
                continue;
            }

            let Some(ssl) = base else {
                bail!("you have not specified a valid SSL key");
            };

            resolver.add(vhost.name(), certified_key(ssl)?)?;
        }

        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver))
    };

    Ok(TlsAcceptor::from(Arc::new(server)))
}

pub(super) async fn listener(
    listener: TcpListener,
    tls: TlsAcceptor,
    gateway: Gateway,
    acceptor: service::vhost::Acceptor,
) {
    let local_addr = match listener.local_addr() {
        Ok(it) => it,
        Err(_) => return,
    };

    while let Ok((socket, address)) = listener.accept().await {
        if let Err(e) = socket.set_nodelay(true) {
            log::error!("tls socket set nodelay failed!: addr={address}, err={e}");
        }

        let tls = tls.clone();
        let gateway = gateway.clone();
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            // a failed handshake never becomes a connection; ignore it
            let Ok(stream) = tls.accept(socket).await else {
                log::warn!("tls handshake failed: addr={address:?}");
                return;
            };

            let conn = next_conn_id();
            log::info!("tls socket accept: addr={address:?}, interface={local_addr:?}, conn={conn}");

            drive(gateway, acceptor, conn, address, stream).await;
        });
    }

    log::error!("tls acceptor close: interface={local_addr:?}");
}
