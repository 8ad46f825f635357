//! TLS for the listener: a single partial server configuration whose
//! certificate is chosen per handshake by SNI, and the self-signed
//! certificate lifecycle behind `tls: "auto"`.

use std::{
    fmt,
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use {
    arc_swap::ArcSwap,
    rcgen::{CertificateParams, DnType, KeyPair, SerialNumber, PKCS_RSA_SHA256},
    rsa::{
        pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding},
        pkcs8::{DecodePrivateKey, EncodePrivateKey},
        RsaPrivateKey,
    },
    rustls::{
        client::danger::HandshakeSignatureValid,
        crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms},
        pki_types::{CertificateDer, UnixTime},
        server::{
            danger::{ClientCertVerified, ClientCertVerifier},
            ClientHello, ResolvesServerCert,
        },
        sign::CertifiedKey,
        DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    },
    time::{Duration, OffsetDateTime},
};

use crate::config::Config;

const KEY_BITS: usize = 4096;
const CERT_LIFETIME_DAYS: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rcgen(#[from] rcgen::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error(transparent)]
    Rsa(#[from] rsa::Error),
    #[error(transparent)]
    Pkcs1(#[from] rsa::pkcs1::Error),
    #[error(transparent)]
    Pkcs8(#[from] rsa::pkcs8::Error),
    #[error("could not parse certificate: {0}")]
    CertParse(String),
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("certificate requires at least one host name")]
    NoHosts,
}

type Result<T> = std::result::Result<T, CertError>;

/// Per-host TLS settings with a single-slot cache of the served key.
///
/// A cached expiry of `None` means the entry stays valid until the server is
/// reconfigured.
pub struct TlsConfig {
    pub host: String,
    pub auto: bool,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    cache: Mutex<Option<(Option<OffsetDateTime>, Arc<CertifiedKey>)>>,
}

impl TlsConfig {
    pub fn new(host: String, auto: bool, cert_path: PathBuf, key_path: PathBuf) -> TlsConfig {
        TlsConfig {
            host,
            auto,
            cert_path,
            key_path,
            cache: Mutex::new(None),
        }
    }

    /// The certificate and key served for this host, deriving and caching
    /// them on first use. With `auto`, an expired certificate is replaced
    /// before loading.
    pub fn certified_key(&self) -> Result<Arc<CertifiedKey>> {
        let mut slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((expiry, key)) = slot.as_ref() {
            if expiry.map_or(true, |expiry| expiry > OffsetDateTime::now_utc()) {
                return Ok(key.clone());
            }
        }

        let expiry = if self.auto {
            Some(update_certificate(
                &self.cert_path,
                &self.key_path,
                std::slice::from_ref(&self.host),
            )?)
        } else {
            // A manually specified certificate is kept until the server is
            // restarted or reconfigured.
            None
        };

        let key = load_certified_key(&self.cert_path, &self.key_path)?;
        *slot = Some((expiry, key.clone()));
        Ok(key)
    }

    pub fn clear_context_cache(&self) {
        *self.cache.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("host", &self.host)
            .field("auto", &self.auto)
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

/// Ensure an unexpired certificate for `hosts` exists at `cert_path` and
/// return its expiry.
///
/// An existing unexpired certificate is left alone. Otherwise a self-signed
/// certificate is issued, reusing the key at `key_path` if there is one and
/// generating a fresh RSA key (persisted unencrypted) if not.
pub fn update_certificate(
    cert_path: &Path,
    key_path: &Path,
    hosts: &[String],
) -> Result<OffsetDateTime> {
    if cert_path.exists() {
        match read_expiry(cert_path) {
            Ok(not_after) if not_after > OffsetDateTime::now_utc() => {
                log::info!("Certificate exists and is unexpired; skipping regeneration.");
                return Ok(not_after);
            }
            Ok(_) => log::info!("Certificate expired; regenerating."),
            Err(err) => {
                log::warn!("Could not read certificate at {cert_path:?} ({err}); regenerating.");
            }
        }
    } else {
        log::info!("Certificate does not exist yet, generating one now.");
    }

    let common_name = hosts.first().ok_or(CertError::NoHosts)?;

    let key = load_or_generate_key(key_path)?;
    let pkcs8 = key.to_pkcs8_pem(LineEnding::LF)?;
    let key_pair = KeyPair::from_pem_and_sign_algo(pkcs8.as_str(), &PKCS_RSA_SHA256)?;

    let mut now = OffsetDateTime::now_utc();
    // X.509 validity has second precision.
    now = now.replace_nanosecond(0).unwrap_or(now);

    let mut params = CertificateParams::new(hosts.to_vec())?;
    params
        .distinguished_name
        .push(DnType::CommonName, common_name.as_str());
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CERT_LIFETIME_DAYS);
    params.serial_number = Some(SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec()));

    let not_after = params.not_after;
    let cert = params.self_signed(&key_pair)?;
    fs::write(cert_path, cert.pem())?;

    log::info!("Success! Certificate generated and saved.");
    Ok(not_after)
}

fn load_or_generate_key(key_path: &Path) -> Result<RsaPrivateKey> {
    if key_path.exists() {
        let pem = fs::read_to_string(key_path)?;
        let key = match RsaPrivateKey::from_pkcs1_pem(&pem) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs8_pem(&pem)?,
        };
        return Ok(key);
    }

    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
    fs::write(key_path, key.to_pkcs1_pem(LineEnding::LF)?.as_bytes())?;
    Ok(key)
}

fn read_expiry(cert_path: &Path) -> Result<OffsetDateTime> {
    let data = fs::read(cert_path)?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(&data)
        .map_err(|err| CertError::CertParse(err.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| CertError::CertParse(err.to_string()))?;
    Ok(cert.validity().not_after.to_datetime())
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| CertError::NoPrivateKey(key_path.to_path_buf()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// The listener's TLS configuration. TLS 1.2 and 1.3 only, client
/// certificates requested but not required, certificate selection by SNI
/// against the current configuration snapshot.
pub fn make_server_config(config: Arc<ArcSwap<Config>>) -> ServerConfig {
    let provider = rustls::crypto::ring::default_provider();
    let algorithms = provider.signature_verification_algorithms;
    let _ = provider.install_default();

    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(OptionalClientCert::new(algorithms)))
        .with_cert_resolver(Arc::new(HostCertResolver::new(config)))
}

/// Picks the certificate for the host named in the client hello.
///
/// An unknown or missing server name refuses the handshake. A failure while
/// preparing the host's certificate is logged and likewise refuses it.
pub struct HostCertResolver {
    config: Arc<ArcSwap<Config>>,
}

impl HostCertResolver {
    pub fn new(config: Arc<ArcSwap<Config>>) -> HostCertResolver {
        HostCertResolver { config }
    }
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            log::debug!("Client sent no server name; refusing handshake");
            return None;
        };

        let config = self.config.load();
        let Some(host) = config.hosts.iter().find(|host| host.host == name) else {
            log::debug!("Received handshake for unknown host {name:?}");
            return None;
        };

        match host.tls.certified_key() {
            Ok(key) => Some(key),
            Err(err) => {
                log::warn!("When preparing certificate for {name}: {err}");
                None
            }
        }
    }
}

impl fmt::Debug for HostCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostCertResolver")
    }
}

/// Requests a client certificate but accepts connections without one, and
/// performs no validation of certificates that are presented. Gemini clients
/// identify themselves with self-signed certificates, so there is no
/// authority to verify against.
struct OptionalClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl OptionalClientCert {
    fn new(algorithms: WebPkiSupportedAlgorithms) -> OptionalClientCert {
        OptionalClientCert { algorithms }
    }
}

impl ClientCertVerifier for OptionalClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl fmt::Debug for OptionalClientCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OptionalClientCert")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let cert_path = tmp.path().join("example.org.cert.pem");
        let key_path = tmp.path().join("example.org.key.pem");
        let hosts = vec!["example.org".to_string()];

        let first = update_certificate(&cert_path, &key_path, &hosts).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());
        assert!(first > OffsetDateTime::now_utc() + Duration::days(CERT_LIFETIME_DAYS - 1));

        let key_pem = fs::read(&key_path).unwrap();
        assert!(String::from_utf8_lossy(&key_pem).contains("BEGIN RSA PRIVATE KEY"));

        // Unexpired, so renewal does nothing and reports the same expiry.
        let second = update_certificate(&cert_path, &key_path, &hosts).unwrap();
        assert_eq!(first, second);

        // A missing certificate is reissued with the existing key.
        fs::remove_file(&cert_path).unwrap();
        let third = update_certificate(&cert_path, &key_path, &hosts).unwrap();
        assert!(cert_path.exists());
        assert_eq!(fs::read(&key_path).unwrap(), key_pem);
        assert!(third >= first);

        // The generated certificate loads into a served key.
        load_certified_key(&cert_path, &key_path).unwrap();
    }

    fn write_test_cert(cert_path: &Path, key_path: &Path, host: &str) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![host.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        fs::write(cert_path, cert.pem()).unwrap();
        fs::write(key_path, key.serialize_pem()).unwrap();
    }

    #[test]
    fn manual_certificates_are_cached_until_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let cert_path = tmp.path().join("cert.pem");
        let key_path = tmp.path().join("key.pem");
        write_test_cert(&cert_path, &key_path, "localhost");

        let tls = TlsConfig::new("localhost".to_string(), false, cert_path, key_path);

        let first = tls.certified_key().unwrap();
        let second = tls.certified_key().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        tls.clear_context_cache();
        let third = tls.certified_key().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn missing_manual_certificate_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let tls = TlsConfig::new(
            "localhost".to_string(),
            false,
            tmp.path().join("nope.cert.pem"),
            tmp.path().join("nope.key.pem"),
        );
        assert!(tls.certified_key().is_err());
    }
}
