use crate::tls::verifier::TraceCertVerifier;
use crate::trace::sink::ClientTrace;
use anyhow::Context;
use chrono::Utc;
use rustls::crypto::ring::{default_provider, DEFAULT_CIPHER_SUITES};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const NETWORK: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Check the server certificate chain and host name.
    pub verify_certificates: bool,
    /// When off, requests carry `Connection: close`.
    pub keep_alive: bool,
    /// PEM bundle to trust instead of the bundled WebPKI roots.
    pub ca_file: Option<PathBuf>,
    /// Deadline for a whole trace.
    pub timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            verify_certificates: false,
            keep_alive: false,
            ca_file: None,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// Opens one fresh connection per trace and reports each step to a
/// [`ClientTrace`].
#[derive(Debug)]
pub struct Transport {
    config: TransportConfig,
    tls_config: Arc<ClientConfig>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Result<Self, anyhow::Error> {
        let mut root_store = RootCertStore::empty();
        if let Some(file_path) = config.ca_file.as_ref() {
            let f = std::fs::File::open(file_path)
                .with_context(|| format!("Failed to open CA file: {}", file_path.display()))?;
            let mut rd = std::io::BufReader::new(f);
            for cert in rustls_pemfile::certs(&mut rd) {
                root_store.add(cert?)?;
            }
            if root_store.is_empty() {
                bail!("No certificates found in CA file: {}", file_path.display());
            }
        } else {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        };

        let provider = Arc::new(CryptoProvider {
            cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
            ..default_provider()
        });

        let verifier =
            TraceCertVerifier::new(config.verify_certificates, provider.clone(), &root_store)?;

        let mut tls_config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
            .with_root_certificates(root_store)
            .with_no_client_auth();
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(verifier));
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config,
            tls_config: Arc::new(tls_config),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Looks up `host` with the system resolver.
    ///
    /// A lookup that fails or returns nothing is still reported to the
    /// trace before the error is returned.
    pub async fn resolve<T: ClientTrace + ?Sized>(
        &self,
        host: &str,
        port: u16,
        trace: &mut T,
    ) -> Result<Vec<SocketAddr>, anyhow::Error> {
        trace.dns_start(Utc::now(), host);

        let lookup_host = host.to_string();
        let lookup = tokio::task::spawn_blocking(move || {
            (lookup_host.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>())
        })
        .await?;
        let at = Utc::now();

        let lookup = lookup.and_then(|addrs| {
            if addrs.is_empty() {
                Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No IP addresses found for host {host}"),
                ))
            } else {
                Ok(addrs)
            }
        });

        match lookup {
            Ok(addrs) => {
                let ips: Vec<IpAddr> = addrs.iter().map(|addr| addr.ip()).collect();
                trace.dns_done(at, &ips, None);
                Ok(addrs)
            }
            Err(e) => {
                trace.dns_done(at, &[], Some(&e));
                Err(anyhow::Error::new(e).context(format!("Failed to resolve {host}")))
            }
        }
    }

    /// Connects to the first address that accepts.
    pub async fn dial<T: ClientTrace + ?Sized>(
        &self,
        addrs: &[SocketAddr],
        trace: &mut T,
    ) -> Result<TcpStream, anyhow::Error> {
        let mut last_error = None;
        for addr in addrs {
            trace.connect_start(Utc::now(), NETWORK, *addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    trace.connect_done(Utc::now(), NETWORK, *addr, None);
                    return Ok(stream);
                }
                Err(e) => {
                    trace.connect_done(Utc::now(), NETWORK, *addr, Some(&e));
                    last_error = Some((*addr, e));
                }
            }
        }
        match last_error {
            Some((addr, e)) => Err(anyhow::Error::new(e).context(format!("Failed to connect to {addr}"))),
            None => Err(anyhow!("No address to connect to")),
        }
    }

    pub async fn handshake_tls(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, anyhow::Error> {
        let connector = TlsConnector::from(self.tls_config.clone());
        let domain = pki_types::ServerName::try_from(host)
            .map_err(|e| anyhow!("{}", e))?
            .to_owned();
        connector
            .connect(domain, stream)
            .await
            .with_context(|| format!("TLS handshake with {host} failed"))
    }
}
