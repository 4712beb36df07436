//! Storage client boundary: crawling a source root and fetching objects.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use regex::Regex;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::errors::{CatalogError, CatalogResult};
use crate::models::{format_unix, FileMeta};

/// Lazily produced crawl results.
pub type FileStream<'a> = Box<dyn Iterator<Item = CatalogResult<FileMeta>> + Send + 'a>;

/// A handle on one storage root.
///
/// Handles are not assumed to be shareable between workers; concurrent users
/// call [`Client::clone_handle`] to get their own.
pub trait Client: Send + Sync {
    /// Storage root URI, e.g. `s3://bucket` or `file:///data`.
    fn uri(&self) -> &str;

    /// Every file at or below `prefix`, with paths relative to the root.
    fn crawl(&self, prefix: &str) -> CatalogResult<FileStream<'_>>;

    fn clone_handle(&self) -> Arc<dyn Client>;

    /// Raw bytes of one object.
    fn fetch_object(&self, path: &str) -> CatalogResult<Vec<u8>>;
}

impl fmt::Debug for dyn Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("uri", &self.uri()).finish()
    }
}

// ---------------------------------------------------------------------------
// Glob helpers
// ---------------------------------------------------------------------------

pub fn has_glob(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

/// Shell-style pattern over one path component: `*`, `?`, `[seq]` and
/// `[!seq]`. An unclosed `[` is literal.
#[derive(Clone, Debug)]
pub struct GlobPattern(Regex);

impl GlobPattern {
    pub fn new(pattern: &str) -> CatalogResult<Self> {
        let mut re = String::from("(?s)^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '[' => {
                    let mut rest = chars.clone();
                    let mut class = String::from("[");
                    if rest.peek() == Some(&'!') {
                        rest.next();
                        class.push('^');
                    }
                    if rest.peek() == Some(&']') {
                        rest.next();
                        class.push_str(r"\]");
                    }
                    let mut closed = false;
                    for c in rest.by_ref() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        if c == '-' {
                            class.push(c);
                        } else {
                            class.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
                        }
                    }
                    if closed {
                        class.push(']');
                        re.push_str(&class);
                        chars = rest;
                    } else {
                        re.push_str(r"\[");
                    }
                }
                other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        re.push('$');
        Regex::new(&re)
            .map(Self)
            .map_err(|e| CatalogError::validation(format!("Invalid glob {pattern}: {e}")))
    }

    pub fn matches(&self, name: &str) -> bool {
        self.0.is_match(name)
    }
}

/// Crawl prefix for a path: a glob in the last component crawls its parent.
pub fn index_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, last)) if has_glob(last) => parent.to_string(),
        None if has_glob(trimmed) => String::new(),
        _ => trimmed.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Local filesystem client
// ---------------------------------------------------------------------------

/// Client over a local directory, addressed as `file://<abs dir>`.
#[derive(Clone, Debug)]
pub struct LocalClient {
    root: PathBuf,
    uri: String,
}

impl LocalClient {
    pub fn new(root: impl AsRef<Path>) -> CatalogResult<Self> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).map_err(|e| {
            CatalogError::Client(format!("{}: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(CatalogError::Client(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let uri = format!("file://{}", root.to_string_lossy().replace('\\', "/"));
        Ok(Self { root, uri })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_meta(&self, path: &Path) -> CatalogResult<FileMeta> {
        let metadata = std::fs::metadata(path)?;
        let rel = path
            .strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| format_unix(d.as_secs() as i64))
            .unwrap_or_default();
        Ok(FileMeta {
            path: rel,
            size: metadata.len() as i64,
            checksum: file_checksum(path)?,
            last_modified,
            custom: IndexMap::new(),
        })
    }
}

impl Client for LocalClient {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn crawl(&self, prefix: &str) -> CatalogResult<FileStream<'_>> {
        let start = self.root.join(prefix.trim_matches('/'));
        if !start.exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = WalkDir::new(start)
            .sort_by_file_name()
            .into_iter()
            .filter_map(move |entry| match entry {
                Ok(e) if e.file_type().is_file() => Some(self.file_meta(e.path())),
                Ok(_) => None,
                Err(e) => Some(Err(CatalogError::Client(e.to_string()))),
            });
        Ok(Box::new(iter))
    }

    fn clone_handle(&self) -> Arc<dyn Client> {
        Arc::new(self.clone())
    }

    fn fetch_object(&self, path: &str) -> CatalogResult<Vec<u8>> {
        Ok(std::fs::read(self.root.join(path.trim_matches('/')))?)
    }
}

/// Hex sha256 of a file's contents, streamed.
fn file_checksum(path: &Path) -> CatalogResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds a client for a storage root URI.
pub type ClientFactory = Arc<dyn Fn(&str) -> CatalogResult<Arc<dyn Client>> + Send + Sync>;

/// Scheme to client factory table. `file://` and bare paths are always
/// served by [`LocalClient`].
#[derive(Clone, Default)]
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, factory: ClientFactory) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Client for a storage URI as recorded in the metastore.
    pub fn client_for(&self, storage_uri: &str) -> CatalogResult<Arc<dyn Client>> {
        match storage_uri.split_once("://") {
            Some(("file", path)) => Ok(Arc::new(LocalClient::new(path)?)),
            Some((scheme, _)) => {
                let factory = self.factories.get(scheme).ok_or_else(|| {
                    CatalogError::Client(format!("Unsupported storage scheme: {scheme}"))
                })?;
                factory(storage_uri)
            }
            None => Ok(Arc::new(LocalClient::new(storage_uri)?)),
        }
    }

    /// Split a source into its storage client and the path inside it.
    ///
    /// `scheme://bucket/a/b` resolves to storage `scheme://bucket` and path
    /// `a/b`. A local directory is its own storage root; a local file or glob
    /// resolves against its parent directory.
    pub fn parse_url(&self, source: &str) -> CatalogResult<(Arc<dyn Client>, String)> {
        let local = match source.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, rest)) => {
                let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(CatalogError::validation(format!("Invalid source uri: {source}")));
                }
                let client = self.client_for(&format!("{scheme}://{bucket}"))?;
                return Ok((client, path.trim_matches('/').to_string()));
            }
            None => source,
        };

        let path = Path::new(local);
        if path.is_dir() {
            return Ok((Arc::new(LocalClient::new(path)?), String::new()));
        }
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok((Arc::new(LocalClient::new(parent)?), name))
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<&String> = self.factories.keys().collect();
        schemes.sort();
        f.debug_struct("ClientRegistry").field("schemes", &schemes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        let matches = |pattern: &str, name: &str| GlobPattern::new(pattern).unwrap().matches(name);
        assert!(matches("*.jpg", "a.jpg"));
        assert!(matches("?.jpg", "a.jpg"));
        assert!(!matches("*.jpg", "a.png"));
        assert!(!matches("*.jpg", "ajpg"));
        assert!(matches("[ab].jpg", "b.jpg"));
        assert!(!matches("[!ab].jpg", "b.jpg"));
        assert!(matches("img[0-9]", "img7"));
        assert!(matches("[]x].txt", "].txt"));
        assert!(matches("a[b", "a[b"));
        assert!(matches("c++ (1).txt", "c++ (1).txt"));
        assert_eq!(index_prefix("imgs/*.jpg"), "imgs");
        assert_eq!(index_prefix("*.jpg"), "");
        assert_eq!(index_prefix("/imgs/cats/"), "imgs/cats");
    }

    #[test]
    fn local_client_crawls_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("imgs")).unwrap();
        std::fs::write(dir.path().join("imgs/a.jpg"), b"aaa").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let client = LocalClient::new(dir.path()).unwrap();
        let files: Vec<FileMeta> = client
            .crawl("")
            .unwrap()
            .collect::<CatalogResult<_>>()
            .unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["b.txt", "imgs/a.jpg"]);
        assert_eq!(files[1].size, 3);
        assert_eq!(files[1].checksum.len(), 64);
        assert_eq!(client.crawl("imgs").unwrap().count(), 1);
        assert_eq!(client.fetch_object("imgs/a.jpg").unwrap(), b"aaa");
    }

    #[test]
    fn parse_url_splits_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"a").unwrap();
        let registry = ClientRegistry::new();

        let (client, path) = registry.parse_url(&dir.path().to_string_lossy()).unwrap();
        assert!(client.uri().starts_with("file://"));
        assert_eq!(path, "");

        let glob = dir.path().join("*.jpg");
        let (client2, path) = registry.parse_url(&glob.to_string_lossy()).unwrap();
        assert_eq!(client.uri(), client2.uri());
        assert_eq!(path, "*.jpg");
    }

    #[test]
    fn unknown_scheme_is_client_error() {
        let registry = ClientRegistry::new();
        assert!(matches!(
            registry.parse_url("gs://bucket/x"),
            Err(CatalogError::Client(_))
        ));
    }
}
