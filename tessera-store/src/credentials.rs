//! Database credentials from an INI file.
//!
//! ```ini
//! [database-credentials]
//! endpoint = /var/lib/tessera
//! database = melanoma
//! user = analyst
//! password = ...
//! ```

use std::fmt;
use std::path::Path;

use ini::Ini;
use tracing::warn;

use tessera_core::{Result, TesseraError};

pub const CREDENTIALS_SECTION: &str = "database-credentials";
pub const DEFAULT_DATABASE: &str = "postgres";

/// Connection parameters for the relational store.
#[derive(Clone, PartialEq, Eq)]
pub struct DbCredentials {
    pub endpoint: String,
    pub database: String,
    pub user: String,
    pub password: String,
}

// Keep the password out of logs.
impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl DbCredentials {
    /// Read `[database-credentials]` from `path`.
    ///
    /// `endpoint`, `user` and `password` are required. An absent, empty or
    /// malformed `database` falls back to `postgres` with a warning.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conf = Ini::load_from_file(path)
            .map_err(|e| TesseraError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&conf)
            .map_err(|e| TesseraError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_ini_str(text: &str) -> Result<Self> {
        let conf = Ini::load_from_str(text).map_err(|e| TesseraError::Config(e.to_string()))?;
        Self::from_ini(&conf)
    }

    fn from_ini(conf: &Ini) -> Result<Self> {
        let section = conf.section(Some(CREDENTIALS_SECTION)).ok_or_else(|| {
            TesseraError::Config(format!("missing section [{}]", CREDENTIALS_SECTION))
        })?;
        let required = |key: &str| -> Result<String> {
            section
                .get(key)
                .map(str::to_string)
                .ok_or_else(|| TesseraError::Config(format!("missing key '{}'", key)))
        };
        Ok(Self {
            endpoint: required("endpoint")?,
            database: sanitize_database_name(section.get("database").unwrap_or("")),
            user: required("user")?,
            password: required("password")?,
        })
    }

    pub fn update_database(mut self, database: &str) -> Self {
        self.database = sanitize_database_name(database);
        self
    }
}

/// Names made of ASCII alphanumerics, `_` and `-` are kept; anything else
/// becomes [`DEFAULT_DATABASE`].
pub fn sanitize_database_name(name: &str) -> String {
    let name = name.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        name.to_string()
    } else {
        warn!(database = name, "invalid database name, using '{}'", DEFAULT_DATABASE);
        DEFAULT_DATABASE.to_string()
    }
}
