//! Runtime configuration.
//!
//! `KilnConfig` is deserializable so a caller can load it from any format it likes;
//! `from_env` assembles the defaults plus `KILN_*` environment overrides.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::build::BuildOptions;
use crate::car::{CarError, CarSigner};
use crate::consts::{DEFAULT_REPO, DEFAULT_SUBSTITUTE_CONCURRENCY};
use crate::execute::RunState;
use crate::platform::paths;
use crate::resolve::ResolveOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value for {var}: '{value}'")]
  InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
  /// Root of the kiln tree (`/kiln` unless overridden).
  pub root: PathBuf,
  /// Store directory; derived from `root` when unset.
  pub store: Option<PathBuf>,
  /// Worker count for remote archive lookups.
  pub substitute_concurrency: usize,
  /// Repository label recorded in package metadata.
  pub repo: String,
  /// Shell used for `shell` operations instead of `/bin/sh`.
  pub shell: Option<String>,
  /// Ed25519 seed used to sign packed archives.
  pub signing_key: Option<PathBuf>,
}

impl Default for KilnConfig {
  fn default() -> Self {
    Self {
      root: paths::root_dir(),
      store: None,
      substitute_concurrency: DEFAULT_SUBSTITUTE_CONCURRENCY,
      repo: DEFAULT_REPO.to_string(),
      shell: None,
      signing_key: None,
    }
  }
}

impl KilnConfig {
  /// Defaults with `KILN_ROOT`, `KILN_STORE`, `KILN_REPO`, `KILN_SHELL`,
  /// `KILN_SIGNING_KEY` and `KILN_SUBSTITUTE_CONCURRENCY` applied.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self {
      store: std::env::var_os("KILN_STORE").map(PathBuf::from),
      ..Self::default()
    };

    if let Ok(repo) = std::env::var("KILN_REPO") {
      config.repo = repo;
    }
    if let Ok(shell) = std::env::var("KILN_SHELL") {
      config.shell = Some(shell);
    }
    if let Some(key) = std::env::var_os("KILN_SIGNING_KEY") {
      config.signing_key = Some(PathBuf::from(key));
    }
    if let Ok(value) = std::env::var("KILN_SUBSTITUTE_CONCURRENCY") {
      config.substitute_concurrency = match value.parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          return Err(ConfigError::InvalidEnv {
            var: "KILN_SUBSTITUTE_CONCURRENCY",
            value,
          });
        }
      };
    }

    Ok(config)
  }

  pub fn store_dir(&self) -> PathBuf {
    self.store.clone().unwrap_or_else(|| self.root.join("store"))
  }

  pub fn roots_dir(&self) -> PathBuf {
    self.root.join("roots")
  }

  pub fn profiles_dir(&self) -> PathBuf {
    self.root.join("profiles")
  }

  pub fn resolve_options(&self) -> ResolveOptions {
    ResolveOptions {
      concurrency: self.substitute_concurrency,
    }
  }

  pub fn build_options(&self) -> BuildOptions {
    BuildOptions {
      state: RunState {
        shell: self.shell.clone(),
        ..RunState::default()
      },
      build_root: None,
    }
  }

  /// The archive signer, if a signing key is configured.
  pub fn signer(&self) -> Result<Option<CarSigner>, CarError> {
    self.signing_key.as_deref().map(CarSigner::from_file).transpose()
  }
}
