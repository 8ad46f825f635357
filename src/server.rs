//! The connection server: TLS accept loop, request line reading, response
//! writing and access logging.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use {
    arc_swap::ArcSwap,
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    },
    tokio_rustls::{server::TlsStream, TlsAcceptor},
};

use crate::{
    certificates::make_server_config,
    config::Config,
    handler::Connection,
    response::{Response, Status},
};

/// One URL of at most 1024 bytes, plus CRLF.
const MAX_REQUEST_LEN: usize = 1024 + 2;

pub struct Server {
    config: Arc<ArcSwap<Config>>,
    acceptor: TlsAcceptor,
}

impl Server {
    pub fn new(config: Arc<ArcSwap<Config>>) -> Server {
        let tls = make_server_config(config.clone());
        Server {
            config,
            acceptor: TlsAcceptor::from(Arc::new(tls)),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.load().port
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let port = self.port();
        let addrs = [
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ];
        TcpListener::bind(&addrs[..]).await
    }

    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let listener = self.bind().await?;
        log::info!("Listening on {}...", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer_addr).await;
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let mut stream = match self.acceptor.accept(stream).await {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("TLS handshake with {peer_addr} failed: {err}");
                return;
            }
        };

        // Requests observe the configuration as it was when they arrived.
        let config = self.config.load_full();

        let peer_cert = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first().cloned());
        let conn = Connection {
            peer_addr,
            peer_cert,
            port: config.port,
        };
        log::debug!(
            "Received connection from {peer_addr} (client certificate {})",
            if conn.peer_cert.is_some() { "present" } else { "absent" }
        );

        let (url, response) = match read_request(&mut stream).await {
            Ok(url) => {
                let response = match config.handler.handle(&url, conn).await {
                    Ok(response) => response,
                    Err(err) => {
                        log::error!("While generating response; {err:#}");
                        Response::new(
                            Status::TemporaryFailure,
                            "Exception thrown during request processing; \
                             see server logs for details.",
                        )
                    }
                };
                (url, response)
            }
            Err(response) => ("-".to_string(), response),
        };

        log::info!(
            target: "amethyst::access",
            "{} {}[{}] {}",
            url,
            response.status.code(),
            response.status.name(),
            response.meta
        );

        if let Err(err) = write_response(&mut stream, &response).await {
            log::error!("While writing response; {err}");
        }
        if let Err(err) = stream.shutdown().await {
            log::debug!("While closing connection; {err}");
        }
    }
}

/// Read the request line. Failures come back as ready-made responses.
async fn read_request(stream: &mut TlsStream<TcpStream>) -> Result<String, Response> {
    let mut request = [0u8; MAX_REQUEST_LEN];
    let mut len = 0;

    loop {
        let read = match stream.read(&mut request[len..]).await {
            Ok(read) => read,
            Err(_) => {
                return Err(Response::new(Status::BadRequest, "Request ended unexpectedly"))
            }
        };
        if read == 0 {
            return Err(Response::new(Status::BadRequest, "Request ended unexpectedly"));
        }
        len += read;

        if let Some(end) = request[..len].windows(2).position(|w| w == b"\r\n") {
            return match std::str::from_utf8(&request[..end]) {
                Ok(url) => Ok(url.to_string()),
                Err(_) => Err(Response::new(Status::BadRequest, "URL must be UTF-8")),
            };
        }

        // Anything that fills the buffer without a terminator is too long.
        if len == request.len() {
            return Err(Response::new(Status::BadRequest, "URL too long!"));
        }
    }
}

async fn write_response(
    stream: &mut TlsStream<TcpStream>,
    response: &Response,
) -> std::io::Result<()> {
    let header = format!("{} {}\r\n", response.status.code(), response.meta);
    stream.write_all(header.as_bytes()).await?;

    if response.status.is_success() {
        if let Some(body) = &response.body {
            stream.write_all(body).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceRegistry;

    use std::path::{Path, PathBuf};

    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::WebPkiSupportedAlgorithms,
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    };

    #[derive(Debug)]
    struct TrustAnything(WebPkiSupportedAlgorithms);

    impl ServerCertVerifier for TrustAnything {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_schemes()
        }
    }

    fn write_test_cert(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
        use rcgen::{CertificateParams, KeyPair};

        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![host.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    async fn start_server(root: &Path, cert_path: &Path, key_path: &Path) -> SocketAddr {
        let doc = serde_json::json!({
            "port": 0,
            "hosts": [{
                "name": "localhost",
                "tls": { "cert_path": cert_path, "key_path": key_path },
                "paths": { "/": { "root": root } }
            }]
        });

        let registry = ResourceRegistry::with_builtins();
        let config = Config::load(doc, &registry).unwrap();
        let config = Arc::new(ArcSwap::from_pointee(config));

        let server = Arc::new(Server::new(config));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        addr
    }

    async fn gemini_request(addr: SocketAddr, request: impl AsRef<[u8]>) -> Vec<u8> {
        let provider = rustls::crypto::ring::default_provider();
        let algorithms = provider.signature_verification_algorithms;
        let _ = provider.install_default();

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustAnything(algorithms)))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost".to_string()).unwrap();
        let mut tls = connector.connect(name, tcp).await.unwrap();

        tls.write_all(request.as_ref()).await.unwrap();
        let mut response = Vec::new();
        tls.read_to_end(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn serves_a_file_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("hello.gmi"), "=> hi").unwrap();
        let (cert, key) = write_test_cert(tmp.path(), "localhost");

        let addr = start_server(&root, &cert, &key).await;
        let response = gemini_request(addr, "gemini://localhost/hello.gmi\r\n").await;
        assert_eq!(response, b"20 text/gemini\r\n=> hi");
    }

    #[tokio::test]
    async fn failure_statuses_carry_no_body() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        std::fs::create_dir(&root).unwrap();
        let (cert, key) = write_test_cert(tmp.path(), "localhost");

        let addr = start_server(&root, &cert, &key).await;
        let response = gemini_request(addr, "gemini://localhost/../etc/passwd\r\n").await;
        assert_eq!(response, b"59 Invalid path\r\n");
    }

    #[tokio::test]
    async fn non_gemini_schemes_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        std::fs::create_dir(&root).unwrap();
        let (cert, key) = write_test_cert(tmp.path(), "localhost");

        let addr = start_server(&root, &cert, &key).await;
        let response = gemini_request(addr, "https://localhost/\r\n").await;
        assert_eq!(
            response,
            b"53 This server does not proxy non-Gemini URLs.\r\n"
        );
    }

    #[tokio::test]
    async fn overlong_urls_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        std::fs::create_dir(&root).unwrap();
        let (cert, key) = write_test_cert(tmp.path(), "localhost");

        let addr = start_server(&root, &cert, &key).await;
        let prefix = "gemini://localhost/";
        let request = format!("{}{}\r\n", prefix, "a".repeat(1025 - prefix.len()));
        let response = gemini_request(addr, request).await;
        assert_eq!(response, b"59 URL too long!\r\n");
    }

    #[tokio::test]
    async fn non_utf8_requests_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("content");
        std::fs::create_dir(&root).unwrap();
        let (cert, key) = write_test_cert(tmp.path(), "localhost");

        let addr = start_server(&root, &cert, &key).await;
        let response = gemini_request(addr, b"gemini://localhost/\xff\r\n".as_slice()).await;
        assert_eq!(response, b"59 URL must be UTF-8\r\n");
    }
}
