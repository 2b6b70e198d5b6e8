//! Persisted OAuth tokens.
//!
//! Tokens are stored in a TOML table keyed by service name
//! (`~/.config/autoid/tokens.toml`), readable only by the owner on Unix:
//!
//! ```toml
//! [autoid-discogs]
//! token = "..."
//! secret = "..."
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// Service name under which Discogs tokens are stored.
pub const DISCOGS_SERVICE: &str = "autoid-discogs";

/// An OAuth token and its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub token: String,
    pub secret: String,
}

/// Somewhere to keep OAuth tokens between runs.
pub trait TokenStore {
    fn load(&self, service: &str) -> Result<Option<TokenPair>, CatalogError>;
    fn save(&self, service: &str, tokens: &TokenPair) -> Result<(), CatalogError>;
    fn clear(&self, service: &str) -> Result<(), CatalogError>;
}

/// [`TokenStore`] backed by a private TOML file.
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: &Path) -> Self {
        FileTokenStore { path: path.to_path_buf() }
    }

    /// The per-user default (`~/.config/autoid/tokens.toml`).
    pub fn default_location() -> Result<Self, CatalogError> {
        let dir = dirs::config_dir()
            .ok_or_else(|| CatalogError::TokenStore("no configuration directory".to_string()))?;
        Ok(Self::new(&dir.join("autoid").join("tokens.toml")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<toml::Table, CatalogError> {
        if !self.path.exists() {
            return Ok(toml::Table::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| CatalogError::TokenStore(format!("{}: {}", self.path.display(), e)))?;
        content
            .parse::<toml::Table>()
            .map_err(|e| CatalogError::TokenStore(format!("{}: {}", self.path.display(), e)))
    }

    /// Write the whole table through a private sibling file, then rename it
    /// over the store so the secrets are never readable by other users.
    fn write_table(&self, table: &toml::Table) -> Result<(), CatalogError> {
        let store_err = |e: io::Error| CatalogError::TokenStore(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(store_err)?;
        }
        let content = toml::to_string_pretty(table).map_err(|e| CatalogError::TokenStore(e.to_string()))?;

        let staging = self.path.with_extension("toml.tmp");
        let written = write_private(&staging, content.as_bytes()).and_then(|()| fs::rename(&staging, &self.path));
        if let Err(e) = written {
            let _ = fs::remove_file(&staging);
            return Err(store_err(e));
        }
        Ok(())
    }
}

/// Create `path` readable by the owner only (0600 on Unix) and write `content`.
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // A stale staging file keeps its old mode; create() does not reset it
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(content)?;
    file.sync_all()
}

impl TokenStore for FileTokenStore {
    fn load(&self, service: &str) -> Result<Option<TokenPair>, CatalogError> {
        let table = self.read_table()?;
        let entry = match table.get(service) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let tokens: TokenPair = entry
            .clone()
            .try_into::<TokenPair>()
            .map_err(|e: toml::de::Error| CatalogError::TokenStore(format!("{}: {}", service, e)))?;
        debug!("Loaded cached tokens for {}", service);
        Ok(Some(tokens))
    }

    fn save(&self, service: &str, tokens: &TokenPair) -> Result<(), CatalogError> {
        let mut table = self.read_table()?;
        let value = toml::Value::try_from(tokens).map_err(|e| CatalogError::TokenStore(e.to_string()))?;
        table.insert(service.to_string(), value);
        self.write_table(&table)
    }

    fn clear(&self, service: &str) -> Result<(), CatalogError> {
        let mut table = self.read_table()?;
        if table.remove(service).is_some() {
            self.write_table(&table)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> TokenPair {
        TokenPair {
            token: "tok".to_string(),
            secret: "sec".to_string(),
        }
    }

    #[test]
    fn test_missing_store_has_no_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(&dir.path().join("tokens.toml"));
        assert_eq!(store.load(DISCOGS_SERVICE).unwrap(), None);
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(&dir.path().join("autoid").join("tokens.toml"));

        store.save(DISCOGS_SERVICE, &pair()).unwrap();
        store.save("other", &TokenPair { token: "a".into(), secret: "b".into() }).unwrap();
        assert_eq!(store.load(DISCOGS_SERVICE).unwrap(), Some(pair()));

        store.clear(DISCOGS_SERVICE).unwrap();
        assert_eq!(store.load(DISCOGS_SERVICE).unwrap(), None);
        assert!(store.load("other").unwrap().is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(&dir.path().join("tokens.toml"));
        store.save(DISCOGS_SERVICE, &pair()).unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_world_readable_store() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        fs::write(&path, "[other]\ntoken = \"a\"\nsecret = \"b\"\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let store = FileTokenStore::new(&path);
        store.save(DISCOGS_SERVICE, &pair()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(store.load("other").unwrap().is_some());
        assert_eq!(store.load(DISCOGS_SERVICE).unwrap(), Some(pair()));
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_staging_file_is_made_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        let staging = path.with_extension("toml.tmp");
        fs::write(&staging, "leftover").unwrap();
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o666)).unwrap();

        FileTokenStore::new(&path).save(DISCOGS_SERVICE, &pair()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!staging.exists());
    }

    #[test]
    fn test_corrupt_entry_is_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        fs::write(&path, "[autoid-discogs]\ntoken = 1\n").unwrap();
        let store = FileTokenStore::new(&path);
        assert!(matches!(store.load(DISCOGS_SERVICE), Err(CatalogError::TokenStore(_))));
    }
}
