//! Anonymous build artifacts: fetched files, literal files and nested sub-builds.

use std::sync::{Arc, OnceLock};

use tracing::trace;

use crate::action::{Checksum, Phase, PhaseBuilder};
use crate::execute::{ExecContext, hash_phase};
use crate::util::hash::{PackageId, Signature, StructHasher};

use super::{Recipe, RecipeError};

/// Version given to instances that do not declare one.
pub const DEFAULT_INSTANCE_VERSION: &str = "0";

#[derive(Debug, Clone)]
pub enum InstanceKind {
  /// A file downloaded and verified against `checksum`.
  Fetch {
    url: String,
    checksum: Checksum,
    filename: String,
  },
  /// A literal file.
  File { contents: String, executable: bool },
  /// A phase run with its own prefix, optionally depending on recipes.
  Build {
    phase: Phase,
    dependencies: Vec<Arc<Recipe>>,
  },
}

/// A content-addressed artifact usable as an input or a dependency.
#[derive(Debug)]
pub struct Instance {
  pub name: String,
  pub version: String,
  pub kind: InstanceKind,
  identity: OnceLock<(Signature, PackageId)>,
}

impl Instance {
  pub fn new(name: impl Into<String>, version: Option<String>, kind: InstanceKind) -> Self {
    Self {
      name: name.into(),
      version: version.unwrap_or_else(|| DEFAULT_INSTANCE_VERSION.to_string()),
      kind,
      identity: OnceLock::new(),
    }
  }

  /// A fetch instance; the file name defaults to the last URL component.
  pub fn fetch(name: impl Into<String>, url: impl Into<String>, checksum: Checksum) -> Self {
    let url = url.into();
    let filename = crate::execute::actions::fetch::url_to_filename(&url);
    Self::new(name, None, InstanceKind::Fetch { url, checksum, filename })
  }

  pub fn file(name: impl Into<String>, contents: impl Into<String>, executable: bool) -> Self {
    Self::new(
      name,
      None,
      InstanceKind::File {
        contents: contents.into(),
        executable,
      },
    )
  }

  pub fn signature(&self) -> Result<Signature, RecipeError> {
    Ok(self.identity()?.0)
  }

  pub fn id(&self) -> Result<&PackageId, RecipeError> {
    Ok(&self.identity()?.1)
  }

  fn identity(&self) -> Result<&(Signature, PackageId), RecipeError> {
    if let Some(identity) = self.identity.get() {
      return Ok(identity);
    }
    let signature = self.compute_signature()?;
    let id = PackageId::new(&signature, &self.name, &self.version);
    trace!(instance = %self.name, id = %id, "computed instance signature");
    Ok(self.identity.get_or_init(|| (signature, id)))
  }

  fn compute_signature(&self) -> Result<Signature, RecipeError> {
    let mut hasher = StructHasher::new();
    hasher.str("name", &self.name).str("version", &self.version);

    match &self.kind {
      InstanceKind::Fetch { url, checksum, filename } => {
        hasher
          .str("kind", "fetch")
          .str("url", url)
          .str("checksum", &checksum.to_string())
          .str("filename", filename);
      }
      InstanceKind::File { contents, executable } => {
        hasher
          .str("kind", "file")
          .bytes("contents", contents.as_bytes())
          .flag("executable", *executable);
      }
      InstanceKind::Build { phase, dependencies } => {
        let mut ctx = ExecContext::canonical();
        let mut dep_ids = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
          let id = dep.id().map_err(|e| RecipeError::Dependency {
            recipe: self.name.clone(),
            dependency: dep.name.clone(),
            source: Box::new(e),
          })?;
          ctx = ctx.with_dep(dep.name.clone(), id.to_string());
          dep_ids.push(id.to_string());
        }
        let digest = hash_phase(phase, ctx).map_err(|source| RecipeError::PhaseHash {
          recipe: self.name.clone(),
          phase: "build",
          source,
        })?;
        hasher
          .str("kind", "build")
          .digest("phase", Some(&digest))
          .set("dependencies", dep_ids.iter().map(String::as_str));
      }
    }

    Ok(hasher.finish())
  }

  /// The phase that materialises this instance under `dir`.
  ///
  /// `dir` is a placeholder template such as [`crate::action::PREFIX`].
  pub fn materialize_phase(&self, dir: &str) -> Phase {
    match &self.kind {
      InstanceKind::Fetch { url, checksum, filename } => {
        let mut ctx = PhaseBuilder::new();
        ctx
          .mkdir(dir)
          .download(url.clone(), format!("{dir}/{filename}"), checksum.clone());
        ctx.finish()
      }
      InstanceKind::File { contents, executable } => {
        let mut ctx = PhaseBuilder::new();
        let path = format!("{dir}/{}", self.name);
        if *executable {
          ctx.write_executable(path, contents.clone());
        } else {
          ctx.write(path, contents.clone());
        }
        ctx.finish()
      }
      InstanceKind::Build { phase, .. } => phase.clone(),
    }
  }

  /// Path of the materialised artifact relative to its directory, if it is a single file.
  pub fn artifact_name(&self) -> Option<&str> {
    match &self.kind {
      InstanceKind::Fetch { filename, .. } => Some(filename),
      InstanceKind::File { .. } => Some(&self.name),
      InstanceKind::Build { .. } => None,
    }
  }

  pub fn dependencies(&self) -> &[Arc<Recipe>] {
    match &self.kind {
      InstanceKind::Build { dependencies, .. } => dependencies,
      _ => &[],
    }
  }
}
