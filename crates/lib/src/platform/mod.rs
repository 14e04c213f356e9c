//! Host platform detection and filesystem layout.

pub mod immutable;
pub mod paths;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating systems kiln knows how to build for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  MacOs,
}

impl Os {
  pub fn current() -> Option<Self> {
    match std::env::consts::OS {
      "linux" => Some(Self::Linux),
      "macos" => Some(Self::MacOs),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::MacOs => "darwin",
    }
  }
}

impl fmt::Display for Os {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  X86_64,
  Aarch64,
}

impl Arch {
  pub fn current() -> Option<Self> {
    match std::env::consts::ARCH {
      "x86_64" => Some(Self::X86_64),
      "aarch64" => Some(Self::Aarch64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::Aarch64 => "aarch64",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Host description embedded in archive info records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlatform {
  pub os: String,
  #[serde(default)]
  pub os_version: String,
  pub arch: String,
}

impl HostPlatform {
  /// Describes the machine we are running on.
  ///
  /// Unsupported values fall back to the raw `std::env::consts` names.
  pub fn detect() -> Self {
    let os = Os::current()
      .map(|o| o.as_str().to_string())
      .unwrap_or_else(|| std::env::consts::OS.to_string());
    let arch = Arch::current()
      .map(|a| a.as_str().to_string())
      .unwrap_or_else(|| std::env::consts::ARCH.to_string());
    let os_version = sysinfo::System::os_version().unwrap_or_default();
    Self { os, os_version, arch }
  }

  /// Default recipe constraint set for this host: `os` and `arch`.
  pub fn constraints(&self) -> BTreeMap<String, String> {
    BTreeMap::from([
      ("os".to_string(), self.os.clone()),
      ("arch".to_string(), self.arch.clone()),
    ])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn macos_uses_darwin_identifier() {
    assert_eq!(Os::MacOs.as_str(), "darwin");
  }

  #[test]
  fn host_constraints_carry_os_and_arch() {
    let host = HostPlatform::detect();
    let constraints = host.constraints();
    assert_eq!(constraints.get("os"), Some(&host.os));
    assert_eq!(constraints.get("arch"), Some(&host.arch));
  }
}
