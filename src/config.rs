//! Configuration loading: the JSON document, per-host TLS settings and the
//! assembly of path maps into a router.

use std::{collections::HashSet, env, path::PathBuf, sync::Arc};

use {
    anyhow::{anyhow, bail, Context as _},
    serde::Deserialize,
    serde_json::Value,
};

use crate::{
    certificates::TlsConfig,
    handler::{GenericHandler, Mount},
    resource::ResourceRegistry,
    util::normalize_path,
};

pub const DEFAULT_PORT: u16 = 1965;

#[derive(Deserialize)]
struct ConfigDoc {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    hosts: Vec<HostDoc>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Deserialize)]
struct HostDoc {
    name: String,
    tls: TlsDoc,
    #[serde(default)]
    paths: serde_json::Map<String, Value>,
}

/// `tls` is either the string `"auto"` or an object with explicit settings.
#[derive(Deserialize)]
#[serde(untagged)]
enum TlsDoc {
    Mode(String),
    Options {
        #[serde(default)]
        auto: bool,
        #[serde(default)]
        cert_path: Option<PathBuf>,
        #[serde(default)]
        key_path: Option<PathBuf>,
    },
}

/// One virtual host: its TLS settings and its mounted resources.
pub struct HostConfig {
    pub host: String,
    pub tls: TlsConfig,
    pub path_map: Vec<Mount>,
}

impl HostConfig {
    fn from_doc(doc: HostDoc, registry: &ResourceRegistry) -> anyhow::Result<HostConfig> {
        let host = doc.name;
        let tls = tls_from_doc(&host, doc.tls)?;

        let mut path_map = Vec::new();
        for (prefix, cfg) in doc.paths {
            let components = normalize_path(&prefix)
                .map_err(|_| anyhow!("invalid mount prefix {prefix:?} for host {host:?}"))?;
            let resource = registry
                .construct(cfg)
                .with_context(|| format!("mount {prefix:?} for host {host:?}"))?;
            path_map.push(Mount {
                prefix: components,
                resource,
            });
        }

        Ok(HostConfig {
            host,
            tls,
            path_map,
        })
    }
}

fn tls_from_doc(host: &str, doc: TlsDoc) -> anyhow::Result<TlsConfig> {
    let (auto, cert_path, key_path) = match doc {
        TlsDoc::Mode(mode) if mode == "auto" => (true, None, None),
        TlsDoc::Mode(mode) => bail!("unknown TLS mode {mode:?} for host {host:?}"),
        TlsDoc::Options {
            auto,
            cert_path,
            key_path,
        } => (auto, cert_path, key_path),
    };

    let state_dir = PathBuf::from(env::var_os("STATE_DIRECTORY").unwrap_or_else(|| ".".into()));

    Ok(TlsConfig::new(
        host.to_string(),
        auto,
        cert_path.unwrap_or_else(|| state_dir.join(format!("{host}.cert.pem"))),
        key_path.unwrap_or_else(|| state_dir.join(format!("{host}.key.pem"))),
    ))
}

/// An immutable configuration snapshot. Reloading builds a fresh snapshot
/// and swaps it in whole; requests keep the one they started with.
pub struct Config {
    pub port: u16,
    pub hosts: Vec<Arc<HostConfig>>,
    pub handler: GenericHandler,
}

impl Config {
    pub fn load(value: Value, registry: &ResourceRegistry) -> anyhow::Result<Config> {
        let doc: ConfigDoc = serde_json::from_value(value).context("malformed configuration")?;

        if doc.hosts.is_empty() {
            bail!("Server can't run without any hosts!");
        }

        let mut seen = HashSet::new();
        for host in &doc.hosts {
            if !seen.insert(host.name.clone()) {
                bail!("host {:?} is configured twice", host.name);
            }
        }

        let hosts = doc
            .hosts
            .into_iter()
            .map(|host| HostConfig::from_doc(host, registry).map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let url_map = hosts
            .iter()
            .map(|host| (host.host.clone(), host.path_map.clone()))
            .collect();

        Ok(Config {
            port: doc.port,
            hosts,
            handler: GenericHandler::new(url_map),
        })
    }
}
