//! Routing of request URLs to resources by host and longest path prefix.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use {rustls::pki_types::CertificateDer, url::Url};

use crate::{
    resource::Resource,
    response::{Response, Status},
    util::normalize_path,
};

/// What the transport layer knows about one accepted connection.
#[derive(Clone, Debug)]
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub peer_cert: Option<CertificateDer<'static>>,
    /// The port the server itself is listening on.
    pub port: u16,
}

/// One routed request, as seen by a resource.
///
/// `path` has the mount prefix stripped and its components normalized;
/// `orig_path` is the path exactly as requested.
#[derive(Clone, Debug)]
pub struct Context {
    pub host: String,
    pub orig_path: String,
    pub path: String,
    pub query: Option<String>,
    pub conn: Connection,
}

/// A resource mounted at a path prefix.
#[derive(Clone)]
pub struct Mount {
    pub prefix: Vec<String>,
    pub resource: Arc<dyn Resource>,
}

pub struct GenericHandler {
    url_map: HashMap<String, Vec<Mount>>,
}

impl GenericHandler {
    pub fn new(url_map: HashMap<String, Vec<Mount>>) -> GenericHandler {
        GenericHandler { url_map }
    }

    pub async fn handle(&self, url: &str, conn: Connection) -> anyhow::Result<Response> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(Response::new(Status::BadRequest, "Invalid URL.")),
        };

        if parsed.scheme() != "gemini" {
            return Ok(Response::new(
                Status::ProxyRequestRefused,
                "This server does not proxy non-Gemini URLs.",
            ));
        }

        let host = parsed.host_str().unwrap_or_default();
        let netloc = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        if let Some(port) = parsed.port() {
            if port != conn.port {
                return Ok(Response::new(
                    Status::ProxyRequestRefused,
                    format!("{netloc} is not served here."),
                ));
            }
        }

        let Some(mounts) = self.url_map.get(host) else {
            log::warn!("Received request for host {host:?} not in URL map");
            return Ok(Response::new(
                Status::ProxyRequestRefused,
                format!("{netloc} is not served here."),
            ));
        };

        // The URL parser collapses dot segments, so traversal attempts have
        // to be caught on the raw request line.
        let raw = raw_path(url);
        let orig_path = if raw.is_empty() { "/" } else { raw };

        let components = match normalize_path(orig_path) {
            Ok(components) => components,
            Err(_) => return Ok(Response::new(Status::BadRequest, "Invalid path")),
        };

        let mut selected: Option<&Mount> = None;
        for mount in mounts {
            if components.len() >= mount.prefix.len()
                && components[..mount.prefix.len()] == mount.prefix[..]
                && selected.map_or(true, |best| mount.prefix.len() > best.prefix.len())
            {
                selected = Some(mount);
            }
        }

        let Some(mount) = selected else {
            return Ok(Response::new(
                Status::NotFound,
                format!("{orig_path} was not found on this server."),
            ));
        };

        let mut path = components[mount.prefix.len()..].join("/");
        if orig_path.ends_with('/') && !path.is_empty() {
            path.push('/');
        }

        let ctx = Context {
            host: netloc,
            orig_path: orig_path.to_string(),
            path,
            query: parsed.query().map(str::to_string),
            conn,
        };

        mount.resource.handle(&ctx).await
    }
}

/// The path part of a request line, without dot-segment collapsing or
/// percent-decoding.
fn raw_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(scheme_end) => &url[scheme_end + 3..],
        None => return "",
    };
    let rest = &rest[..rest.find(['?', '#']).unwrap_or(rest.len())];
    match rest.find('/') {
        Some(authority_end) => &rest[authority_end..],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoResource;

    #[async_trait::async_trait]
    impl Resource for EchoResource {
        async fn handle(&self, ctx: &Context) -> anyhow::Result<Response> {
            Ok(Response::success(
                "text/gemini",
                format!(
                    "path={};orig={};host={};query={}",
                    ctx.path,
                    ctx.orig_path,
                    ctx.host,
                    ctx.query.as_deref().unwrap_or("-")
                ),
            ))
        }
    }

    fn handler() -> GenericHandler {
        let mount = |prefix: &[&str]| Mount {
            prefix: prefix.iter().map(|c| c.to_string()).collect(),
            resource: Arc::new(EchoResource),
        };
        let mut url_map = HashMap::new();
        url_map.insert(
            "h".to_string(),
            vec![mount(&[]), mount(&["app"]), mount(&["app", "sub"])],
        );
        GenericHandler::new(url_map)
    }

    fn conn() -> Connection {
        Connection {
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            peer_cert: None,
            port: 1965,
        }
    }

    async fn request(url: &str) -> Response {
        handler().handle(url, conn()).await.unwrap()
    }

    fn body(response: &Response) -> String {
        String::from_utf8(response.body.clone().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn non_gemini_scheme_is_refused() {
        let response = request("https://h/").await;
        assert_eq!(response.status, Status::ProxyRequestRefused);
        assert_eq!(response.meta, "This server does not proxy non-Gemini URLs.");
    }

    #[tokio::test]
    async fn relative_url_is_rejected() {
        let response = request("no-scheme-here/path").await;
        assert_eq!(response.status, Status::BadRequest);
    }

    #[tokio::test]
    async fn foreign_port_is_refused() {
        let response = request("gemini://h:1966/").await;
        assert_eq!(response.status, Status::ProxyRequestRefused);
        assert_eq!(response.meta, "h:1966 is not served here.");
    }

    #[tokio::test]
    async fn own_port_is_stripped_for_lookup_but_kept_in_host() {
        let response = request("gemini://h:1965/x").await;
        assert_eq!(response.status, Status::Success);
        assert_eq!(body(&response), "path=x;orig=/x;host=h:1965;query=-");
    }

    #[tokio::test]
    async fn unknown_host_is_refused() {
        let response = request("gemini://elsewhere/").await;
        assert_eq!(response.status, Status::ProxyRequestRefused);
        assert_eq!(response.meta, "elsewhere is not served here.");
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let response = request("gemini://h/../etc/passwd").await;
        assert_eq!(response.status, Status::BadRequest);
        assert_eq!(response.meta, "Invalid path");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let response = request("gemini://h/app/sub/file.gmi").await;
        assert_eq!(body(&response), "path=file.gmi;orig=/app/sub/file.gmi;host=h;query=-");

        let response = request("gemini://h/app/other").await;
        assert_eq!(body(&response), "path=other;orig=/app/other;host=h;query=-");

        let response = request("gemini://h/top.gmi").await;
        assert_eq!(body(&response), "path=top.gmi;orig=/top.gmi;host=h;query=-");
    }

    #[tokio::test]
    async fn empty_path_maps_to_root() {
        let response = request("gemini://h").await;
        assert_eq!(body(&response), "path=;orig=/;host=h;query=-");
    }

    #[tokio::test]
    async fn trailing_slash_is_preserved() {
        let response = request("gemini://h/app/dir/").await;
        assert_eq!(body(&response), "path=dir/;orig=/app/dir/;host=h;query=-");
    }

    #[tokio::test]
    async fn query_is_passed_through() {
        let response = request("gemini://h/app?input=hello").await;
        assert_eq!(body(&response), "path=;orig=/app;host=h;query=input=hello");
    }
}
