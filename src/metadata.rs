//! Per-directory `.meta` configuration.
//!
//! A `.meta` file is INI. The `[.]` section applies to the directory itself,
//! a section named after a file applies to exactly that file. Directories
//! inherit settings from their ancestors up to the resource root; settings
//! closer to the file win. Recognized keys: `cgi`, `autoindex`, `index`,
//! `mime`. Unknown keys are ignored.

use std::path::Path;

use configparser::ini::Ini;

pub const META_FILENAME: &str = ".meta";

const DIRECTORY_SECTION: &str = ".";
const DEFAULT_INDEX: &str = "index.gmi";

/// Settings for one file or directory. `None` means "inherit".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    cgi: Option<bool>,
    autoindex: Option<bool>,
    index: Option<String>,
    mime: Option<String>,
}

impl Meta {
    pub fn cgi(&self) -> bool {
        self.cgi.unwrap_or(false)
    }

    pub fn autoindex(&self) -> bool {
        self.autoindex.unwrap_or(false)
    }

    pub fn index(&self) -> &str {
        self.index.as_deref().unwrap_or(DEFAULT_INDEX)
    }

    pub fn mime(&self) -> Option<&str> {
        self.mime.as_deref()
    }

    /// Overlay `other` onto `self`; fields `other` leaves unset keep their value.
    fn overlay(&mut self, other: Meta) {
        if other.cgi.is_some() {
            self.cgi = other.cgi;
        }
        if other.autoindex.is_some() {
            self.autoindex = other.autoindex;
        }
        if other.index.is_some() {
            self.index = other.index;
        }
        if other.mime.is_some() {
            self.mime = other.mime;
        }
    }
}

/// One parsed `.meta` file.
struct MetaFile {
    ini: Ini,
}

impl MetaFile {
    fn parse(content: String) -> Result<MetaFile, String> {
        // Section and key lookups are case sensitive; sections name files.
        let mut ini = Ini::new_cs();
        ini.read(content)?;
        Ok(MetaFile { ini })
    }

    fn directory(&self) -> Meta {
        self.section(DIRECTORY_SECTION)
    }

    fn section(&self, name: &str) -> Meta {
        Meta {
            cgi: self.bool_key(name, "cgi"),
            autoindex: self.bool_key(name, "autoindex"),
            index: self.ini.get(name, "index"),
            mime: self.ini.get(name, "mime"),
        }
    }

    fn bool_key(&self, section: &str, key: &str) -> Option<bool> {
        match self.ini.getbool(section, key) {
            Ok(value) => value,
            Err(err) => {
                log::warn!("Ignoring bad value for {key} in [{section}]: {err}");
                None
            }
        }
    }
}

async fn load_meta_file(dir: &Path) -> Option<MetaFile> {
    let path = dir.join(META_FILENAME);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            log::warn!("Could not read {path:?}: {err}");
            return None;
        }
    };

    match MetaFile::parse(content) {
        Ok(meta) => Some(meta),
        Err(err) => {
            log::warn!("Could not parse {path:?}: {err}");
            None
        }
    }
}

/// Resolve the effective settings for `dir` (and, if given, the file named
/// `file_name` inside it), inheriting from every `.meta` between `root` and
/// `dir`.
pub async fn resolve_meta(root: &Path, dir: &Path, file_name: Option<&str>) -> Meta {
    // Ancestor chain from root down to dir, root first.
    let mut chain = vec![dir];
    let mut current = dir;
    while current != root {
        match current.parent() {
            Some(parent) => {
                chain.push(parent);
                current = parent;
            }
            None => break,
        }
    }
    chain.reverse();

    let mut meta = Meta::default();
    let last = chain.len() - 1;
    for (depth, ancestor) in chain.iter().enumerate() {
        let Some(file) = load_meta_file(ancestor).await else {
            continue;
        };
        meta.overlay(file.directory());
        if depth == last {
            if let Some(name) = file_name {
                meta.overlay(file.section(name));
            }
        }
    }

    meta
}
