//! Module for file-cache configuration settings.
//!
//! The mount layer deserializes this block from its configuration file and
//! hands it to [`FileCache::new`](crate::cache::fcache::FileCache::new).

use std::path::PathBuf;

use bytesize::ByteSize;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_max_size_mb() -> i64 {
    -1
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp/blob-fs/cache")
}

fn default_download_chunk_size_mb() -> u64 {
    8
}

fn default_max_parallel_downloads() -> i64 {
    -1
}

/// The file-cache configuration block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileCacheConfig {
    /// Byte budget of the cache in MiB. `-1` means unbounded.
    pub max_size_mb: i64,

    /// Root directory for cached files. A `file-cache` sub-directory is
    /// created beneath it.
    pub cache_dir: PathBuf,

    /// Whether a first read at a non-zero offset admits a cache entry.
    /// When false, such reads are served directly from the object store.
    pub cache_file_for_range_read: bool,

    /// Chunk granularity of the download loop, in MiB.
    pub download_chunk_size_mb: u64,

    /// Upper bound on concurrently downloading jobs. `-1` means unbounded.
    pub max_parallel_downloads: i64,

    /// Objects whose composed `bucket/object` name matches are never cached.
    /// Takes precedence over `include-regex`.
    pub exclude_regex: Option<String>,

    /// When set, only objects whose composed `bucket/object` name matches
    /// are cached.
    pub include_regex: Option<String>,

    /// Compute a checksum of each object while downloading it. The checksum
    /// is logged, never verified.
    pub enable_crc: bool,

    /// Open cached files with O_DIRECT, bypassing the OS page cache.
    pub enable_o_direct: bool,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            max_size_mb: default_max_size_mb(),
            cache_dir: default_cache_dir(),
            cache_file_for_range_read: false,
            download_chunk_size_mb: default_download_chunk_size_mb(),
            max_parallel_downloads: default_max_parallel_downloads(),
            exclude_regex: None,
            include_regex: None,
            enable_crc: false,
            enable_o_direct: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid exclude-regex: {0}")]
    BadExcludeRegex(#[source] regex::Error),

    #[error("invalid include-regex: {0}")]
    BadIncludeRegex(#[source] regex::Error),
}

impl FileCacheConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache_dir.as_os_str().is_empty() {
            errors.push("cache-dir must not be empty.".to_owned());
        }
        if self.max_size_mb < -1 {
            errors.push(format!(
                "max-size-mb must be -1 (unbounded) or non-negative, got {}.",
                self.max_size_mb
            ));
        }
        if self.download_chunk_size_mb == 0 {
            errors.push("download-chunk-size-mb must be at least 1.".to_owned());
        }
        if self.max_parallel_downloads < -1 || self.max_parallel_downloads == 0 {
            errors.push(format!(
                "max-parallel-downloads must be -1 (unbounded) or positive, got {}.",
                self.max_parallel_downloads
            ));
        }
        if let Err(e) = self.compile_filters() {
            errors.push(e.to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// The cache byte budget. `-1` maps to the largest representable budget.
    pub fn budget_bytes(&self) -> u64 {
        if self.max_size_mb < 0 {
            u64::MAX
        } else {
            ByteSize::mib(self.max_size_mb as u64).as_u64()
        }
    }

    /// The download chunk size in bytes.
    pub fn chunk_bytes(&self) -> u64 {
        ByteSize::mib(self.download_chunk_size_mb.max(1)).as_u64()
    }

    /// Number of concurrent-download permits, or `None` for unbounded.
    pub fn download_permits(&self) -> Option<usize> {
        if self.max_parallel_downloads < 0 {
            None
        } else {
            Some((self.max_parallel_downloads as usize).max(1))
        }
    }

    /// Compile the include/exclude patterns into a [`NameFilter`].
    pub fn compile_filters(&self) -> Result<NameFilter, ConfigError> {
        let exclude = self
            .exclude_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(ConfigError::BadExcludeRegex)?;
        let include = self
            .include_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(ConfigError::BadIncludeRegex)?;
        Ok(NameFilter { exclude, include })
    }
}

/// Compiled admission filter over composed `bucket/object` names.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    exclude: Option<Regex>,
    include: Option<Regex>,
}

impl NameFilter {
    /// Whether the object must not be cached. Exclusion wins over inclusion.
    pub fn excludes(&self, bucket_name: &str, object_name: &str) -> bool {
        let composed = format!("{bucket_name}/{object_name}");
        if let Some(exclude) = &self.exclude
            && exclude.is_match(&composed)
        {
            return true;
        }
        if let Some(include) = &self.include
            && !include.is_match(&composed)
        {
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = FileCacheConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.budget_bytes(), u64::MAX, "-1 means unbounded");
        assert_eq!(config.download_permits(), None);
    }

    #[test]
    fn deserializes_from_kebab_case_toml() {
        let config: FileCacheConfig = toml::from_str(
            r#"
            max-size-mb = 128
            cache-dir = "/var/cache/blob-fs"
            cache-file-for-range-read = true
            download-chunk-size-mb = 4
            max-parallel-downloads = 3
            exclude-regex = "\\.tmp$"
            "#,
        )
        .expect("config should deserialize");

        assert_eq!(config.max_size_mb, 128);
        assert_eq!(config.budget_bytes(), ByteSize::mib(128).as_u64());
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/blob-fs"));
        assert!(config.cache_file_for_range_read);
        assert_eq!(config.chunk_bytes(), ByteSize::mib(4).as_u64());
        assert_eq!(config.download_permits(), Some(3));
        assert_eq!(config.exclude_regex.as_deref(), Some("\\.tmp$"));
    }

    #[test]
    fn validate_rejects_bad_regex() {
        let config = FileCacheConfig {
            exclude_regex: Some("(unclosed".to_owned()),
            ..FileCacheConfig::default()
        };
        let errors = config.validate().expect_err("bad regex should fail");
        assert!(
            errors.iter().any(|e| e.contains("exclude-regex")),
            "errors should name the offending option: {errors:?}"
        );
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let config = FileCacheConfig {
            download_chunk_size_mb: 0,
            ..FileCacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn exclude_wins_over_include() {
        let config = FileCacheConfig {
            exclude_regex: Some("^buk/secret".to_owned()),
            include_regex: Some(".*".to_owned()),
            ..FileCacheConfig::default()
        };
        let filter = config.compile_filters().expect("filters should compile");

        assert!(filter.excludes("buk", "secret/key"));
        assert!(!filter.excludes("buk", "public/data"));
    }

    #[test]
    fn include_regex_gates_admission() {
        let config = FileCacheConfig {
            include_regex: Some(r"\.bin$".to_owned()),
            ..FileCacheConfig::default()
        };
        let filter = config.compile_filters().expect("filters should compile");

        assert!(!filter.excludes("buk", "model.bin"));
        assert!(filter.excludes("buk", "notes.txt"));
    }
}
