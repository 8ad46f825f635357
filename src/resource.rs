//! Resources turn a routed request into a response.
//!
//! The registry maps resource type names to factories so configuration can
//! assemble a path map from plain JSON objects. Built in: `filesystem` and
//! `redirect`.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use {
    anyhow::{anyhow, bail, Context as _},
    serde::Deserialize,
    serde_json::Value,
};

use crate::{
    handler::Context,
    metadata::{self, META_FILENAME},
    mime::guess_mime_type,
    response::{Response, Status},
    util::normalize_path,
};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const SERVER_PROTOCOL: &str = "Gemini/0.16.0";
const SERVER_SOFTWARE: &str = "Amethyst";

#[async_trait::async_trait]
pub trait Resource: Send + Sync {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Response>;
}

pub type ResourceFactory = fn(Value) -> anyhow::Result<Arc<dyn Resource>>;

/// Name-indexed resource factories. Filled once at startup; configuration
/// loading only reads it.
pub struct ResourceRegistry {
    factories: HashMap<String, ResourceFactory>,
}

impl ResourceRegistry {
    pub fn with_builtins() -> ResourceRegistry {
        let mut registry = ResourceRegistry {
            factories: HashMap::new(),
        };
        registry.register("filesystem", filesystem_factory);
        registry.register("redirect", redirect_factory);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ResourceFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Build a resource from one `paths` entry. The `type` field picks the
    /// factory (default `filesystem`); all other fields go to the factory.
    pub fn construct(&self, cfg: Value) -> anyhow::Result<Arc<dyn Resource>> {
        let Value::Object(mut cfg) = cfg else {
            bail!("resource configuration must be an object");
        };

        let type_name = match cfg.remove("type") {
            None => "filesystem".to_string(),
            Some(Value::String(name)) => name,
            Some(other) => bail!("resource type must be a string, not {other}"),
        };

        let factory = self
            .factories
            .get(&type_name)
            .ok_or_else(|| anyhow!("unknown resource type {type_name:?}"))?;
        factory(Value::Object(cfg)).with_context(|| format!("constructing {type_name:?} resource"))
    }
}

impl Default for ResourceRegistry {
    fn default() -> ResourceRegistry {
        ResourceRegistry::with_builtins()
    }
}

fn filesystem_factory(args: Value) -> anyhow::Result<Arc<dyn Resource>> {
    fn default_mime_type() -> String {
        DEFAULT_MIME_TYPE.to_string()
    }

    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Args {
        root: PathBuf,
        #[serde(default)]
        cgi: bool,
        #[serde(default = "default_mime_type")]
        default_mime_type: String,
    }

    let args: Args = serde_json::from_value(args)?;
    Ok(Arc::new(FilesystemResource::new(
        args.root,
        args.cgi,
        args.default_mime_type,
    )?))
}

fn redirect_factory(args: Value) -> anyhow::Result<Arc<dyn Resource>> {
    #[derive(Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Args {
        to: String,
        #[serde(default)]
        permanent: bool,
    }

    let args: Args = serde_json::from_value(args)?;
    Ok(Arc::new(RedirectResource::new(args.to, args.permanent)))
}

/// Serves a directory tree: static files, directory indexes and, when
/// enabled both on the mount and in `.meta`, CGI scripts.
pub struct FilesystemResource {
    root: PathBuf,
    cgi: bool,
    default_mime_type: String,
}

/// Where a request path landed in the tree.
///
/// `extra` holds the components that did not resolve to anything on disk;
/// for a CGI script they become `PATH_INFO`.
struct PathInfo {
    components: Vec<String>,
    resolved: PathBuf,
    extra: Vec<String>,
    is_dir: bool,
}

impl FilesystemResource {
    pub fn new(
        root: impl Into<PathBuf>,
        cgi: bool,
        default_mime_type: impl Into<String>,
    ) -> anyhow::Result<FilesystemResource> {
        let root = root.into();
        let root = std::fs::canonicalize(&root)
            .with_context(|| format!("filesystem resource root {root:?}"))?;
        Ok(FilesystemResource {
            root,
            cgi,
            default_mime_type: default_mime_type.into(),
        })
    }

    /// Longest prefix of `components` that exists under the root.
    async fn find_path(&self, components: &[String]) -> Option<PathInfo> {
        for split in (0..=components.len()).rev() {
            let mut resolved = self.root.clone();
            for comp in &components[..split] {
                resolved.push(comp);
            }

            let Ok(md) = tokio::fs::metadata(&resolved).await else {
                continue;
            };
            return Some(PathInfo {
                components: components.to_vec(),
                resolved,
                extra: components[split..].to_vec(),
                is_dir: md.is_dir(),
            });
        }
        None
    }

    fn not_found(&self, ctx: &Context) -> Response {
        Response::new(
            Status::NotFound,
            format!("{} was not found on this server.", ctx.orig_path),
        )
    }

    async fn list_directory(&self, ctx: &Context, dir: &Path) -> anyhow::Result<Response> {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == META_FILENAME {
                continue;
            }
            let is_dir = entry.file_type().await?.is_dir();
            entries.push((name, is_dir));
        }
        entries.sort();

        let mut lines = vec![format!("# Directory listing of {}", ctx.orig_path), String::new()];
        lines.extend(entries.into_iter().map(|(name, is_dir)| {
            if is_dir {
                format!("=> {name}/")
            } else {
                format!("=> {name}")
            }
        }));

        Ok(Response::success("text/gemini", lines.join("\n")))
    }

    async fn do_cgi(&self, ctx: &Context, info: &PathInfo) -> anyhow::Result<Response> {
        let script_components = &info.components[..info.components.len() - info.extra.len()];
        let script_name = format!("/{}", script_components.join("/"));
        let path_info = if info.extra.is_empty() {
            String::new()
        } else {
            format!("/{}", info.extra.join("/"))
        };

        log::debug!("Starting CGI script {:?}", info.resolved);

        let output = tokio::process::Command::new(&info.resolved)
            .stdin(Stdio::null())
            .env("GATEWAY_INTERFACE", "CGI/1.1")
            .env("QUERY_STRING", ctx.query.as_deref().unwrap_or(""))
            .env("REMOTE_ADDR", ctx.conn.peer_addr.ip().to_string())
            .env("SCRIPT_NAME", script_name)
            .env("PATH_INFO", path_info)
            .env("SERVER_NAME", &ctx.host)
            .env("SERVER_PORT", ctx.conn.port.to_string())
            .env("SERVER_PROTOCOL", SERVER_PROTOCOL)
            .env("SERVER_SOFTWARE", SERVER_SOFTWARE)
            .output()
            .await?;

        let code = output.status.code().unwrap_or(-1);
        log::info!(
            target: "amethyst::resource::cgi",
            "{:?} returned {} (stdout bytes {}, stderr bytes {})",
            info.resolved,
            code,
            output.stdout.len(),
            output.stderr.len()
        );

        if !output.status.success() {
            log::error!(
                "{:?} stderr: {}",
                info.resolved,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
            return Ok(Response::new(
                Status::CgiError,
                format!("Script returned {code} (see logs)"),
            ));
        }

        Ok(parse_cgi_output(&output.stdout))
    }
}

#[async_trait::async_trait]
impl Resource for FilesystemResource {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Response> {
        let components = match normalize_path(&ctx.path) {
            Ok(components) => components,
            Err(_) => {
                log::warn!("Tried to handle disallowed path {:?}!", ctx.orig_path);
                return Ok(Response::new(Status::BadRequest, "Invalid path"));
            }
        };

        // Never serve the configuration files themselves.
        if components.last().is_some_and(|comp| comp == META_FILENAME) {
            return Ok(self.not_found(ctx));
        }

        let Some(mut info) = self.find_path(&components).await else {
            return Ok(self.not_found(ctx));
        };

        if !info.resolved.starts_with(&self.root) {
            log::warn!("Tried to handle from disallowed path {:?}!", info.resolved);
            return Ok(Response::new(Status::BadRequest, "Invalid path"));
        }

        if info.is_dir {
            if !info.extra.is_empty() {
                return Ok(self.not_found(ctx));
            }

            let dir_meta = metadata::resolve_meta(&self.root, &info.resolved, None).await;
            let index_path = info.resolved.join(dir_meta.index());
            match tokio::fs::metadata(&index_path).await {
                Ok(md) if md.is_file() => {
                    log::debug!(
                        "Sending index file {:?} for request to {}",
                        index_path,
                        ctx.orig_path
                    );
                    info.components.push(dir_meta.index().to_string());
                    info.resolved = index_path;
                    info.is_dir = false;
                }
                _ if dir_meta.autoindex() => {
                    log::debug!(
                        "Performing directory listing of {:?} for request to {}",
                        info.resolved,
                        ctx.orig_path
                    );
                    return self.list_directory(ctx, &info.resolved).await;
                }
                _ => return Ok(self.not_found(ctx)),
            }
        }

        let file_name = info
            .resolved
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);
        let parent = info.resolved.parent().unwrap_or(&self.root);
        let meta = metadata::resolve_meta(&self.root, parent, file_name.as_deref()).await;

        if self.cgi && meta.cgi() && is_executable(&info.resolved).await {
            return self.do_cgi(ctx, &info).await;
        }

        if !info.extra.is_empty() {
            return Ok(self.not_found(ctx));
        }

        let contents = match tokio::fs::read(&info.resolved).await {
            Ok(contents) => contents,
            Err(err) => {
                log::debug!("Could not read {:?}: {}", info.resolved, err);
                return Ok(self.not_found(ctx));
            }
        };

        let mime = meta
            .mime()
            .map(str::to_string)
            .or_else(|| file_name.as_deref().and_then(guess_mime_type))
            .unwrap_or_else(|| self.default_mime_type.clone());

        log::debug!(
            "Sending file {:?} ({} bytes) as {}",
            info.resolved,
            contents.len(),
            mime
        );

        Ok(Response::success(mime, contents))
    }
}

/// Split CGI stdout into a header block and the body.
///
/// Headers run until an empty line or a line without a colon; a non-empty
/// terminating line belongs to the body. `location:` wins immediately.
fn parse_cgi_output(stdout: &[u8]) -> Response {
    let lines: Vec<&[u8]> = stdout.split(|&byte| byte == b'\n').collect();

    let mut mime = String::from("text/gemini");
    let mut status = Status::Success;
    let mut body_start = lines.len();

    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            body_start = i + 1;
            break;
        }

        let header = std::str::from_utf8(line)
            .ok()
            .and_then(|line| line.split_once(':'));
        let Some((key, value)) = header else {
            body_start = i;
            break;
        };

        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "content-type" => mime = value.to_string(),
            "status" => {
                if let Some(parsed) = value.parse::<u8>().ok().and_then(Status::from_code) {
                    status = parsed;
                }
            }
            "location" => return Response::new(Status::RedirectTemporary, value),
            _ => {}
        }
    }

    let body = lines
        .get(body_start..)
        .unwrap_or_default()
        .join(&b"\n"[..]);
    Response::with_body(status, mime, body)
}

#[cfg(unix)]
async fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match tokio::fs::metadata(path).await {
        Ok(md) => md.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable(_path: &Path) -> bool {
    false
}

/// Sends every request below its mount to another URL prefix.
pub struct RedirectResource {
    to: String,
    permanent: bool,
}

impl RedirectResource {
    pub fn new(to: String, permanent: bool) -> RedirectResource {
        RedirectResource { to, permanent }
    }
}

#[async_trait::async_trait]
impl Resource for RedirectResource {
    async fn handle(&self, ctx: &Context) -> anyhow::Result<Response> {
        // ctx.path is built from normalized components and never starts
        // with a slash.
        let target = format!("{}/{}", self.to.trim_end_matches('/'), ctx.path);

        let status = if self.permanent {
            Status::RedirectPermanent
        } else {
            Status::RedirectTemporary
        };
        Ok(Response::new(status, target))
    }
}
