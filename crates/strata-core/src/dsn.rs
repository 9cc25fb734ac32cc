//! Data-source string parsing.
//!
//! `file:` URIs with an opaque or absolute path plus recognized query
//! options, e.g. `file:app.db?mode=rwc&journal_mode=WAL&busy_timeout=2000`.
//! A bare path (no scheme) and the `:memory:` shorthand are accepted.
//! Unknown options are rejected outright — a misspelled durability knob
//! silently ignored is worse than a failed open.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_error::{Result, StrataError};
use strata_types::limits::DEFAULT_BUSY_TIMEOUT_MS;
use strata_types::{JournalMode, PageSize, SynchronousMode};

/// File access mode from the `mode` option.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Read-only; the file must exist.
    ReadOnly,
    /// Read-write; the file must exist.
    ReadWrite,
    /// Read-write, created if missing.
    #[default]
    ReadWriteCreate,
    /// Purely in-memory database.
    Memory,
}

/// In-process page cache scope from the `cache` option.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheScope {
    /// One pager per canonical path, shared across handles.
    Shared,
    /// Every handle gets its own pager.
    #[default]
    Private,
}

/// Parsed data-source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Database file path (ignored for `Memory` beyond identification).
    pub path: PathBuf,
    /// Access mode.
    pub mode: AccessMode,
    /// Cache scope.
    pub cache: CacheScope,
    /// Durability mode.
    pub journal_mode: JournalMode,
    /// Whether `journal_mode` was given explicitly. When it was not, an
    /// existing database's declared format (header read_format) wins over
    /// the `DELETE` default.
    pub journal_mode_explicit: bool,
    /// Lock-contention budget.
    #[serde(with = "duration_millis")]
    pub busy_timeout: Duration,
    /// Page size applied when the database is created.
    pub page_size: PageSize,
    /// Sync frequency.
    pub synchronous: SynchronousMode,
    /// Stored for the upper layers; the core enforces nothing with it.
    pub foreign_keys: bool,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            mode: AccessMode::default(),
            cache: CacheScope::default(),
            journal_mode: JournalMode::default(),
            journal_mode_explicit: false,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            page_size: PageSize::DEFAULT,
            synchronous: SynchronousMode::default(),
            foreign_keys: false,
        }
    }
}

impl DataSourceConfig {
    /// Parse a data-source string.
    pub fn parse(dsn: &str) -> Result<Self> {
        let mut config = Self::default();

        let rest = match dsn.strip_prefix("file:") {
            Some(rest) => rest,
            None => {
                // A bare path carries no options.
                if dsn == ":memory:" {
                    config.mode = AccessMode::Memory;
                    config.path = PathBuf::from(":memory:");
                } else {
                    config.path = PathBuf::from(dsn);
                }
                return Ok(config);
            }
        };

        let (path_part, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        config.path = PathBuf::from(parse_uri_path(path_part)?);
        if path_part == ":memory:" {
            config.mode = AccessMode::Memory;
        }

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').ok_or_else(|| StrataError::InvalidDsn {
                    detail: format!("option without value: '{pair}'"),
                })?;
                config.apply_option(key, value)?;
            }
        }
        Ok(config)
    }

    /// True when the database lives in process memory only.
    #[must_use]
    pub fn is_memory(&self) -> bool {
        self.mode == AccessMode::Memory
    }

    /// True when writes must be rejected.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.mode == AccessMode::ReadOnly
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        let invalid = |detail: String| StrataError::InvalidDsn { detail };
        match key {
            "mode" => {
                self.mode = match value.to_ascii_lowercase().as_str() {
                    "ro" => AccessMode::ReadOnly,
                    "rw" => AccessMode::ReadWrite,
                    "rwc" => AccessMode::ReadWriteCreate,
                    "memory" => AccessMode::Memory,
                    other => return Err(invalid(format!("invalid mode: '{other}'"))),
                };
            }
            "cache" => {
                self.cache = match value.to_ascii_lowercase().as_str() {
                    "shared" => CacheScope::Shared,
                    "private" => CacheScope::Private,
                    other => return Err(invalid(format!("invalid cache: '{other}'"))),
                };
            }
            "journal_mode" => {
                self.journal_mode = JournalMode::parse(value)
                    .ok_or_else(|| invalid(format!("invalid journal_mode: '{value}'")))?;
                self.journal_mode_explicit = true;
            }
            "busy_timeout" => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| invalid(format!("invalid busy_timeout: '{value}'")))?;
                self.busy_timeout = Duration::from_millis(ms);
            }
            "page_size" => {
                let raw: u32 = value
                    .parse()
                    .map_err(|_| invalid(format!("invalid page_size: '{value}'")))?;
                self.page_size = PageSize::new(raw).ok_or_else(|| {
                    invalid(format!(
                        "page_size must be a power of two in 512..=65536, got {raw}"
                    ))
                })?;
            }
            "synchronous" => {
                self.synchronous = SynchronousMode::parse(value)
                    .ok_or_else(|| invalid(format!("invalid synchronous: '{value}'")))?;
            }
            "foreign_keys" => {
                self.foreign_keys = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => true,
                    "false" | "0" | "off" => false,
                    other => return Err(invalid(format!("invalid foreign_keys: '{other}'"))),
                };
            }
            unknown => {
                return Err(invalid(format!("unknown option: '{unknown}'")));
            }
        }
        Ok(())
    }
}

/// Resolve the path portion of a `file:` URI.
fn parse_uri_path(path_part: &str) -> Result<String> {
    if let Some(after) = path_part.strip_prefix("//") {
        // file://host/path — only the empty (localhost) authority is
        // supported.
        return match after.find('/') {
            Some(0) => Ok(after.to_owned()),
            _ => Err(StrataError::InvalidDsn {
                detail: format!("unsupported authority in 'file://{after}'"),
            }),
        };
    }
    Ok(path_part.to_owned())
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        u64::try_from(d.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let config = DataSourceConfig::parse("file:test.db").unwrap();
        assert_eq!(config.path, PathBuf::from("test.db"));
        assert_eq!(config.mode, AccessMode::ReadWriteCreate);
        assert_eq!(config.cache, CacheScope::Private);
        assert_eq!(config.journal_mode, JournalMode::Delete);
        assert_eq!(config.busy_timeout, Duration::from_millis(5000));
        assert_eq!(config.page_size, PageSize::DEFAULT);
        assert_eq!(config.synchronous, SynchronousMode::Full);
        assert!(!config.foreign_keys);
    }

    #[test]
    fn full_option_set() {
        let config = DataSourceConfig::parse(
            "file:/data/app.db?mode=rw&cache=shared&journal_mode=WAL&busy_timeout=250&page_size=8192&synchronous=NORMAL&foreign_keys=true",
        )
        .unwrap();
        assert_eq!(config.path, PathBuf::from("/data/app.db"));
        assert_eq!(config.mode, AccessMode::ReadWrite);
        assert_eq!(config.cache, CacheScope::Shared);
        assert_eq!(config.journal_mode, JournalMode::Wal);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
        assert_eq!(config.page_size, PageSize::new(8192).unwrap());
        assert_eq!(config.synchronous, SynchronousMode::Normal);
        assert!(config.foreign_keys);
    }

    #[test]
    fn triple_slash_absolute_path() {
        let config = DataSourceConfig::parse("file:///var/db/x.db").unwrap();
        assert_eq!(config.path, PathBuf::from("/var/db/x.db"));
    }

    #[test]
    fn authority_is_rejected() {
        assert!(matches!(
            DataSourceConfig::parse("file://somehost/x.db").unwrap_err(),
            StrataError::InvalidDsn { .. }
        ));
    }

    #[test]
    fn unknown_option_fails_closed() {
        assert!(matches!(
            DataSourceConfig::parse("file:test.db?journl_mode=WAL").unwrap_err(),
            StrataError::InvalidDsn { .. }
        ));
    }

    #[test]
    fn option_without_value_is_rejected() {
        assert!(DataSourceConfig::parse("file:test.db?mode").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(DataSourceConfig::parse("file:t.db?mode=append").is_err());
        assert!(DataSourceConfig::parse("file:t.db?page_size=3000").is_err());
        assert!(DataSourceConfig::parse("file:t.db?page_size=256").is_err());
        assert!(DataSourceConfig::parse("file:t.db?busy_timeout=-5").is_err());
        assert!(DataSourceConfig::parse("file:t.db?journal_mode=BOGUS").is_err());
        assert!(DataSourceConfig::parse("file:t.db?synchronous=EXTRA").is_err());
        assert!(DataSourceConfig::parse("file:t.db?foreign_keys=maybe").is_err());
    }

    #[test]
    fn memory_shorthands() {
        assert!(DataSourceConfig::parse(":memory:").unwrap().is_memory());
        assert!(DataSourceConfig::parse("file::memory:").unwrap().is_memory());
        assert!(DataSourceConfig::parse("file:x.db?mode=memory")
            .unwrap()
            .is_memory());
    }

    #[test]
    fn bare_path_without_scheme() {
        let config = DataSourceConfig::parse("/plain/path.db").unwrap();
        assert_eq!(config.path, PathBuf::from("/plain/path.db"));
        assert_eq!(config.mode, AccessMode::ReadWriteCreate);
    }

    #[test]
    fn page_size_boundaries() {
        assert_eq!(
            DataSourceConfig::parse("file:t.db?page_size=512")
                .unwrap()
                .page_size,
            PageSize::MIN
        );
        assert_eq!(
            DataSourceConfig::parse("file:t.db?page_size=65536")
                .unwrap()
                .page_size,
            PageSize::MAX
        );
    }
}
