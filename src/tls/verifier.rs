use pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::{DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::sync::Arc;
use x509_parser::parse_x509_certificate;

/// Logs the server certificate and, when asked to, checks its chain and
/// name against `root_store`.
///
/// Handshake signatures are checked either way, so the negotiated keys
/// stay tied to the presented certificate.
#[derive(Debug)]
pub struct TraceCertVerifier {
    chain: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl TraceCertVerifier {
    pub fn new(
        verify_certificates: bool,
        provider: Arc<CryptoProvider>,
        root_store: &RootCertStore,
    ) -> Result<Self, anyhow::Error> {
        let algorithms = provider.signature_verification_algorithms;
        let chain = if verify_certificates {
            Some(
                WebPkiServerVerifier::builder_with_provider(root_store.clone().into(), provider)
                    .build()?,
            )
        } else {
            None
        };
        Ok(Self { chain, algorithms })
    }
}

fn log_certificate(end_entity: &CertificateDer<'_>) {
    match parse_x509_certificate(end_entity.as_ref()) {
        Ok((_, cert)) => {
            debug!("Server certificate subject: {}", cert.subject());
            debug!("Server certificate issuer: {}", cert.issuer());
            debug!(
                "Server certificate validity: {} - {}",
                cert.validity().not_before,
                cert.validity().not_after
            );
        }
        Err(e) => debug!("Failed to parse server certificate: {e}"),
    }
}

impl ServerCertVerifier for TraceCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        log_certificate(end_entity);

        match &self.chain {
            Some(chain) => {
                chain.verify_server_cert(end_entity, intermediates, server_name, ocsp, now)
            }
            None => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
