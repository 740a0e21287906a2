//! Property sources
//!
//! Two external sources feed the configuration resolver:
//!
//! - the deployment-wide properties file `<install>/lib/xmlguard.properties`,
//!   shared by every configuration in the process through a cache that
//!   re-reads the file only when its modification time advances;
//! - per-process properties, snapshotted from the environment when a
//!   resolver is built.
//!
//! Failures while reading either source are never surfaced: the source is
//! simply treated as absent.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use tracing::{debug, trace};

/// Environment variable naming the installation directory
pub const HOME_ENV: &str = "XMLGUARD_HOME";

/// File name of the deployment properties file, under `<install>/lib`
pub const PROPERTIES_FILE: &str = "xmlguard.properties";

/// A source of string-valued properties
pub trait PropertySource: fmt::Debug + Send + Sync {
    /// Look up a property by name
    fn property(&self, name: &str) -> Option<String>;
}

/// Parsed `key=value` pairs, in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: IndexMap<String, String>,
}

impl Properties {
    /// Parse properties-file syntax
    ///
    /// Supports `key=value`, `key: value` and `key value` separators, `#` and
    /// `!` comment lines, and trailing-backslash line continuation.
    pub fn parse(text: &str) -> Self {
        let mut entries = IndexMap::new();
        let mut logical = String::new();

        for raw in text.lines() {
            let line = if logical.is_empty() { raw.trim_start() } else { raw.trim() };
            if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
                continue;
            }

            let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
            if trailing % 2 == 1 {
                logical.push_str(&line[..line.len() - 1]);
                continue;
            }
            logical.push_str(line);

            let (key, value) = split_entry(&logical);
            entries.insert(key.to_string(), value.to_string());
            logical.clear();
        }

        if !logical.is_empty() {
            let (key, value) = split_entry(&logical);
            entries.insert(key.to_string(), value.to_string());
        }

        Self { entries }
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in file order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn split_entry(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c == '=' || c == ':' || c.is_whitespace())
        .unwrap_or(line.len());
    let key = &line[..end];
    let mut rest = line[end..].trim_start();
    if let Some(stripped) = rest.strip_prefix(&['=', ':'][..]) {
        rest = stripped.trim_start();
    }
    (key, rest.trim_end())
}

/// Filesystem operations the cache depends on
pub trait FileSystem: fmt::Debug + Send + Sync {
    /// Modification time, or `None` if the file does not exist
    fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>>;

    /// Read a file as UTF-8
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// The real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn modified(&self, path: &Path) -> io::Result<Option<SystemTime>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.modified().map(Some),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    properties: Option<Arc<Properties>>,
    last_modified: Option<SystemTime>,
}

impl CacheState {
    fn clear(&mut self) {
        self.properties = None;
        self.last_modified = None;
    }
}

/// Cache of the deployment properties file
///
/// Staleness check and reload happen under one lock, so configurations built
/// concurrently never observe a half-updated cache.
#[derive(Debug)]
pub struct PropertiesCache<F: FileSystem = StdFileSystem> {
    fs: F,
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

static GLOBAL_CACHE: Lazy<Arc<PropertiesCache<StdFileSystem>>> =
    Lazy::new(|| Arc::new(PropertiesCache::new(StdFileSystem, default_properties_path())));

impl PropertiesCache<StdFileSystem> {
    /// The process-wide cache over the installation properties file
    pub fn global() -> Arc<PropertiesCache<StdFileSystem>> {
        Arc::clone(&GLOBAL_CACHE)
    }
}

impl<F: FileSystem> PropertiesCache<F> {
    /// Create a cache for `path`; `None` means no file is ever consulted
    pub fn new(fs: F, path: Option<PathBuf>) -> Self {
        Self {
            fs,
            path,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Path of the cached file
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current file contents, reloading if the file changed
    pub fn current(&self) -> Option<Arc<Properties>> {
        let path = self.path.as_deref()?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match self.fs.modified(path) {
            Ok(Some(mtime)) => {
                if state.last_modified.map_or(true, |seen| seen < mtime) {
                    match self.fs.read_to_string(path) {
                        Ok(text) => {
                            let properties = Properties::parse(&text);
                            debug!(path = %path.display(), entries = properties.len(), "loaded deployment properties");
                            state.properties = Some(Arc::new(properties));
                            state.last_modified = Some(mtime);
                        }
                        Err(e) => {
                            debug!(path = %path.display(), error = %e, "cannot read deployment properties");
                            state.clear();
                        }
                    }
                }
            }
            Ok(None) => {
                if state.properties.is_some() {
                    trace!(path = %path.display(), "deployment properties removed");
                }
                state.clear();
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "cannot stat deployment properties");
                state.clear();
            }
        }

        state.properties.clone()
    }
}

impl<F: FileSystem> PropertySource for PropertiesCache<F> {
    fn property(&self, name: &str) -> Option<String> {
        self.current()
            .and_then(|props| props.get(name).map(str::to_string))
    }
}

/// Location of the deployment properties file
///
/// `$XMLGUARD_HOME/lib/xmlguard.properties`, or relative to the directory
/// above the running executable.
pub fn default_properties_path() -> Option<PathBuf> {
    let home = match std::env::var_os(HOME_ENV) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => std::env::current_exe()
            .ok()?
            .parent()?
            .parent()?
            .to_path_buf(),
    };
    Some(home.join("lib").join(PROPERTIES_FILE))
}

/// In-memory properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapProperties {
    values: HashMap<String, String>,
}

impl MapProperties {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Add a property in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Snapshot the named properties from the process environment
    ///
    /// Each name is tried verbatim, then in `UPPER_SNAKE` form
    /// (`jdk.xml.maxOccur` becomes `JDK_XML_MAXOCCUR`).
    pub fn from_env<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut props = Self::new();
        for name in names {
            let value = std::env::var(name)
                .or_else(|_| std::env::var(env_spelling(name)))
                .ok();
            if let Some(value) = value {
                trace!(name, value = %value, "process property");
                props.insert(name, value);
            }
        }
        props
    }
}

impl PropertySource for MapProperties {
    fn property(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// Environment-variable spelling of a property name
pub fn env_spelling(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct FakeFs {
        file: Mutex<Option<(SystemTime, String)>>,
        reads: Mutex<usize>,
        fail_stat: Mutex<bool>,
    }

    impl FakeFs {
        fn put(&self, secs: u64, text: &str) {
            *self.file.lock().unwrap() =
                Some((SystemTime::UNIX_EPOCH + Duration::from_secs(secs), text.to_string()));
        }

        fn remove(&self) {
            *self.file.lock().unwrap() = None;
        }

        fn reads(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    impl FileSystem for Arc<FakeFs> {
        fn modified(&self, _path: &Path) -> io::Result<Option<SystemTime>> {
            if *self.fail_stat.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(self.file.lock().unwrap().as_ref().map(|(t, _)| *t))
        }

        fn read_to_string(&self, _path: &Path) -> io::Result<String> {
            *self.reads.lock().unwrap() += 1;
            self.file
                .lock()
                .unwrap()
                .as_ref()
                .map(|(_, text)| text.clone())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    fn cache(fs: &Arc<FakeFs>) -> PropertiesCache<Arc<FakeFs>> {
        PropertiesCache::new(Arc::clone(fs), Some(PathBuf::from("/opt/xmlguard/lib/xmlguard.properties")))
    }

    #[test]
    fn test_parse_properties() {
        let props = Properties::parse(
            "# comment\n! also comment\n\njdk.xml.maxOccur=7\n  a : b c \nspaced value\nlong = one \\\n    two\n",
        );
        assert_eq!(props.get("jdk.xml.maxOccur"), Some("7"));
        assert_eq!(props.get("a"), Some("b c"));
        assert_eq!(props.get("spaced"), Some("value"));
        assert_eq!(props.get("long"), Some("one two"));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_parse_empty_value() {
        let props = Properties::parse("javax.xml.accessExternalDTD=\n");
        assert_eq!(props.get("javax.xml.accessExternalDTD"), Some(""));
    }

    #[test]
    fn test_cache_reads_once_until_modified() {
        let fs = Arc::new(FakeFs::default());
        fs.put(10, "k=1");
        let cache = cache(&fs);

        assert_eq!(cache.property("k").as_deref(), Some("1"));
        assert_eq!(cache.property("k").as_deref(), Some("1"));
        assert_eq!(fs.reads(), 1);

        // Same timestamp: content changes are not noticed.
        fs.put(10, "k=2");
        assert_eq!(cache.property("k").as_deref(), Some("1"));

        fs.put(11, "k=3");
        assert_eq!(cache.property("k").as_deref(), Some("3"));
        assert_eq!(fs.reads(), 2);
    }

    #[test]
    fn test_cache_cleared_when_file_disappears() {
        let fs = Arc::new(FakeFs::default());
        fs.put(10, "k=1");
        let cache = cache(&fs);
        assert!(cache.current().is_some());

        fs.remove();
        assert!(cache.current().is_none());

        fs.put(5, "k=older");
        assert_eq!(cache.property("k").as_deref(), Some("older"));
    }

    #[test]
    fn test_stat_failure_is_treated_as_absent() {
        let fs = Arc::new(FakeFs::default());
        fs.put(10, "k=1");
        let cache = cache(&fs);
        assert!(cache.current().is_some());

        *fs.fail_stat.lock().unwrap() = true;
        assert!(cache.current().is_none());

        *fs.fail_stat.lock().unwrap() = false;
        assert_eq!(cache.property("k").as_deref(), Some("1"));
        assert_eq!(fs.reads(), 2);
    }

    #[test]
    fn test_real_file_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(PROPERTIES_FILE);
        std::fs::write(&path, "jdk.xml.totalEntitySizeLimit=1234\n").unwrap();

        let cache = PropertiesCache::new(StdFileSystem, Some(path));
        assert_eq!(
            cache.property("jdk.xml.totalEntitySizeLimit").as_deref(),
            Some("1234")
        );
        assert_eq!(cache.property("jdk.xml.maxOccur"), None);
    }

    #[test]
    fn test_no_path_never_reads() {
        let cache = PropertiesCache::new(StdFileSystem, None);
        assert!(cache.current().is_none());
    }

    #[test]
    fn test_env_spelling() {
        assert_eq!(env_spelling("jdk.xml.maxOccur"), "JDK_XML_MAXOCCUR");
        assert_eq!(env_spelling("javax.xml.accessExternalDTD"), "JAVAX_XML_ACCESSEXTERNALDTD");
    }

    #[test]
    fn test_map_properties() {
        let props = MapProperties::new().with("a", "1");
        assert_eq!(props.property("a").as_deref(), Some("1"));
        assert_eq!(props.property("b"), None);
    }
}
