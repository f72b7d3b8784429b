use crate::session::{SessionError, SessionOptions};
use crate::target::Mode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while loading a configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        /// The path that was attempted.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The file was read but is not a valid configuration.
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        /// The path of the offending file.
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// The `[fuzzer]` table: how the session runs.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Bridge mode; async unless set.
    #[serde(default)]
    pub mode: Mode,
    /// Passed to the driving loop before the derived options below.
    #[serde(default)]
    pub fuzzer_options: Vec<String>,
    /// Only run the seed inputs.
    #[serde(default)]
    pub dry_run: bool,
    /// Slow-unit limit, rounded up to whole seconds for `-timeout`.
    pub timeout_ms: Option<u64>,
    /// Mutation runs after the seed pass, forwarded as `-runs`.
    pub runs: Option<u64>,
}

/// Demo fuzz targets shipped with the command-line tool.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum HarnessKind {
    /// Panics on inputs starting with `BAD` or `CRAS`.
    #[default]
    BadInput,
    /// Same checks, reported through a deferred result.
    DeferredBadInput,
    /// Accepts everything.
    Clean,
}

impl FromStr for HarnessKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bad-input" => Ok(HarnessKind::BadInput),
            "deferred-bad-input" => Ok(HarnessKind::DeferredBadInput),
            "clean" => Ok(HarnessKind::Clean),
            other => Err(format!(
                "unknown harness '{other}', expected one of: bad-input, deferred-bad-input, clean"
            )),
        }
    }
}

/// The `[harness]` table: which demo target the command-line tool runs.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default)]
    pub kind: HarnessKind,
}

/// Top-level configuration, usually read from `ferry.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FerryConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub harness: HarnessSettings,
}

impl FerryConfig {
    /// Reads and parses a configuration file.
    ///
    /// # Arguments
    /// * `path`: The TOML file to load.
    ///
    /// # Returns
    /// The parsed configuration, or a `ConfigError` naming `path`.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The argument list forwarded to the driving loop.
    ///
    /// Derived options come after the user's own so they take precedence;
    /// a dry run's `-runs=0` is always last.
    pub fn fuzzer_args(&self) -> Result<Vec<String>, SessionError> {
        let fuzzer = &self.fuzzer;
        let mut args = fuzzer.fuzzer_options.clone();
        if let Some(runs) = fuzzer.runs {
            args.push(format!("-runs={runs}"));
        }
        if let Some(timeout_ms) = fuzzer.timeout_ms {
            if timeout_ms == 0 {
                return Err(SessionError::MalformedArguments(
                    "timeout-ms must be greater than 0".to_string(),
                ));
            }
            args.push(format!("-timeout={}", timeout_ms.div_ceil(1000)));
        }
        if fuzzer.dry_run {
            args.push("-runs=0".to_string());
        }
        if let Some(arg) = args.iter().find(|a| a.contains('\0')) {
            return Err(SessionError::MalformedArguments(format!(
                "argument {arg:?} contains a NUL byte"
            )));
        }
        Ok(args)
    }

    /// Session options for this configuration, with the derived arguments.
    pub fn session_options(&self) -> Result<SessionOptions, SessionError> {
        Ok(SessionOptions {
            mode: self.fuzzer.mode,
            fuzzer_args: self.fuzzer_args()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn full_config_parses() {
        let config = FerryConfig::from_toml(
            r#"
            [fuzzer]
            mode = "sync"
            fuzzer-options = ["-max_len=64", "corpus"]
            dry-run = false
            timeout-ms = 2500
            runs = 100

            [harness]
            kind = "deferred-bad-input"
            "#,
        )
        .unwrap();
        assert_eq!(config.fuzzer.mode, Mode::Sync);
        assert_eq!(config.harness.kind, HarnessKind::DeferredBadInput);
        assert_eq!(
            config.fuzzer_args().unwrap(),
            vec!["-max_len=64", "corpus", "-runs=100", "-timeout=3"]
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = FerryConfig::from_toml("").unwrap();
        assert_eq!(config, FerryConfig::default());
        assert_eq!(config.fuzzer.mode, Mode::Async);
        assert!(config.fuzzer_args().unwrap().is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(FerryConfig::from_toml("[fuzzer]\nthreads = 4\n").is_err());
    }

    #[test]
    fn dry_run_appends_zero_runs_last() {
        let mut config = FerryConfig::default();
        config.fuzzer.runs = Some(50);
        config.fuzzer.dry_run = true;
        let args = config.fuzzer_args().unwrap();
        assert_eq!(args.last().map(String::as_str), Some("-runs=0"));
    }

    #[test]
    fn zero_timeout_and_nul_bytes_are_malformed() {
        let mut config = FerryConfig::default();
        config.fuzzer.timeout_ms = Some(0);
        assert!(matches!(
            config.fuzzer_args(),
            Err(SessionError::MalformedArguments(_))
        ));

        let mut config = FerryConfig::default();
        config.fuzzer.fuzzer_options = vec!["a\0b".to_string()];
        assert!(matches!(
            config.session_options(),
            Err(SessionError::MalformedArguments(_))
        ));
    }

    #[test]
    fn load_from_file_reports_the_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(&path, "[harness]\nkind = \"clean\"\n").unwrap();
        let config = FerryConfig::load_from_file(&path).unwrap();
        assert_eq!(config.harness.kind, HarnessKind::Clean);

        let missing = dir.path().join("missing.toml");
        let error = FerryConfig::load_from_file(&missing).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
        assert!(error.to_string().contains("missing.toml"));
    }

    #[test]
    fn harness_names_parse() {
        assert_eq!("clean".parse::<HarnessKind>(), Ok(HarnessKind::Clean));
        assert!("nope".parse::<HarnessKind>().is_err());
    }
}
