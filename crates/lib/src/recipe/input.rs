//! Named build inputs and their content sums.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::util::hash::{hash_directory, hash_file};

use super::{Instance, RecipeError};

/// Where an input comes from, as declared by the recipe.
#[derive(Debug, Clone)]
pub enum InputSource {
  /// A file or directory, relative to the recipe's directory.
  Path(PathBuf),
  Instance(Arc<Instance>),
}

#[derive(Debug, Clone)]
pub struct InputDecl {
  pub name: String,
  pub source: InputSource,
}

impl InputDecl {
  pub fn path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      source: InputSource::Path(path.into()),
    }
  }

  pub fn instance(name: impl Into<String>, instance: Arc<Instance>) -> Self {
    Self {
      name: name.into(),
      source: InputSource::Instance(instance),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
  File,
  Directory,
  Instance,
}

/// An input with its content sum computed.
#[derive(Debug, Clone)]
pub struct Input {
  pub name: String,
  pub kind: InputKind,
  /// `sha256` for paths, `instance` for instances.
  pub sum_type: String,
  /// Hex digest for paths, the instance package ID for instances.
  pub sum: String,
  pub path: Option<PathBuf>,
  pub instance: Option<Arc<Instance>>,
}

impl Input {
  /// The string that stands for this input in signatures: `name:sum_type:sum`.
  pub fn identity(&self) -> String {
    format!("{}:{}:{}", self.name, self.sum_type, self.sum)
  }

  /// The persisted form written to `.pkg-info.json`.
  pub fn record(&self) -> InputRecord {
    let path = self.path.as_ref().map(|p| p.display().to_string());
    InputRecord {
      name: self.name.clone(),
      sum_type: self.sum_type.clone(),
      sum: self.sum.clone(),
      dir: path.clone().filter(|_| self.kind == InputKind::Directory),
      path: path.filter(|_| self.kind == InputKind::File),
      id: (self.kind == InputKind::Instance).then(|| self.sum.clone()),
    }
  }
}

/// Input entry of `.pkg-info.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
  pub name: String,
  pub sum_type: String,
  pub sum: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dir: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<String>,
}

/// Hashes one declared input; `base` anchors relative paths.
pub(crate) fn resolve_input(recipe: &str, decl: &InputDecl, base: &Path) -> Result<Input, RecipeError> {
  match &decl.source {
    InputSource::Path(rel) => {
      let path = base.join(rel);
      let meta = std::fs::metadata(&path).map_err(|_| RecipeError::InputMissing {
        recipe: recipe.to_string(),
        input: decl.name.clone(),
        path: path.clone(),
      })?;
      let hash_err = |source| RecipeError::Input {
        recipe: recipe.to_string(),
        input: decl.name.clone(),
        source,
      };
      let (kind, sum) = if meta.is_dir() {
        (InputKind::Directory, hash_directory(&path, &[]).map_err(hash_err)?)
      } else {
        (InputKind::File, hash_file(&path).map_err(hash_err)?)
      };
      Ok(Input {
        name: decl.name.clone(),
        kind,
        sum_type: "sha256".to_string(),
        sum: sum.0,
        path: Some(path),
        instance: None,
      })
    }
    InputSource::Instance(instance) => Ok(Input {
      name: decl.name.clone(),
      kind: InputKind::Instance,
      sum_type: "instance".to_string(),
      sum: instance.id()?.to_string(),
      path: None,
      instance: Some(Arc::clone(instance)),
    }),
  }
}
