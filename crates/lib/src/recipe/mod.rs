//! Recipes: validated package definitions.
//!
//! The scripting layer hands over a [`Prototype`], a bag of named [`Value`]s.
//! [`Recipe::from_attrs`] validates it into an immutable [`Recipe`] whose
//! dependencies are themselves recipes, de-duplicated by package ID.
//!
//! Identity (signature and ID) is computed on first request by
//! [`crate::signature`] and cached on the recipe, as are the hashed inputs.

mod cache;
mod input;
mod instance;
mod value;

pub use cache::{RecipeCache, RecipeKey};
pub use input::{Input, InputDecl, InputKind, InputRecord, InputSource};
pub use instance::{DEFAULT_INSTANCE_VERSION, Instance, InstanceKind};
pub use value::{Attrs, Prototype, Value};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::action::Phase;
use crate::consts::DEFAULT_REPO;
use crate::execute::ExecuteError;
use crate::signature::SignatureError;
use crate::util::hash::{HashError, PackageId, Signature};

/// Platform and feature constraints, e.g. `os = "linux"`, `arch = "x86_64"`.
pub type Constraints = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("{recipe}: missing required attribute '{attr}'")]
  MissingAttr { recipe: String, attr: String },

  #[error("{recipe}: attribute '{attr}' must be {expected}, got {found}")]
  InvalidAttr {
    recipe: String,
    attr: String,
    expected: &'static str,
    found: &'static str,
  },

  #[error("{object} has no attribute '{attr}'")]
  UnknownAttr { object: String, attr: String },

  #[error("dependency cycle while loading '{0}'")]
  Cycle(String),

  #[error("{recipe}: input '{input}' not found at {path}")]
  InputMissing {
    recipe: String,
    input: String,
    path: PathBuf,
  },

  #[error("{recipe}: failed to hash input '{input}': {source}")]
  Input {
    recipe: String,
    input: String,
    #[source]
    source: HashError,
  },

  #[error("{recipe}: failed to hash {phase} phase: {source}")]
  PhaseHash {
    recipe: String,
    phase: &'static str,
    #[source]
    source: ExecuteError,
  },

  #[error("{recipe}: dependency '{dependency}' has no identity: {source}")]
  Dependency {
    recipe: String,
    dependency: String,
    #[source]
    source: Box<SignatureError>,
  },

  #[error("failed to load recipe '{name}': {message}")]
  Load { name: String, message: String },
}

/// A validated, immutable package definition.
#[derive(Debug)]
pub struct Recipe {
  pub name: String,
  pub version: String,
  pub description: String,
  pub url: Option<String>,
  pub metadata: BTreeMap<String, String>,
  pub namespace: String,
  pub repo: String,
  pub constraints: Constraints,
  /// Every dependency, explicit ones included, unique by package ID in declaration order.
  pub dependencies: Vec<Arc<Recipe>>,
  /// Dependencies that are always runtime dependencies, whatever the build references.
  pub explicit_dependencies: Vec<Arc<Recipe>>,
  pub inputs: Vec<InputDecl>,
  pub install: Option<Phase>,
  pub post_install: Option<Phase>,
  /// Runs after the entry is frozen; never part of the signature.
  pub hook: Option<Phase>,
  /// Directory the definition was loaded from; relative input paths start here.
  pub source_dir: PathBuf,
  resolved_inputs: OnceLock<Vec<Input>>,
  pub(crate) identity: OnceLock<(Signature, PackageId)>,
}

impl Recipe {
  pub fn builder(name: impl Into<String>, version: impl Into<String>) -> RecipeBuilder {
    RecipeBuilder::new(name, version)
  }

  /// Validates a definition read through [`Attrs`].
  pub fn from_attrs(
    source: &dyn Attrs,
    source_dir: &Path,
    namespace: &str,
    constraints: &Constraints,
  ) -> Result<Recipe, RecipeError> {
    let name = source
      .attr("name")?
      .as_text()
      .filter(|n| !n.is_empty())
      .ok_or_else(|| RecipeError::MissingAttr {
        recipe: format!("{namespace}/<unnamed>"),
        attr: "name".to_string(),
      })?;
    let reader = AttrReader { source, recipe: &name };

    let version = reader.required_text("version")?;
    let mut builder = RecipeBuilder::new(name.clone(), version)
      .namespace(namespace)
      .constraints(constraints.clone())
      .source_dir(source_dir);

    if let Some(description) = reader.optional_text("description")? {
      builder = builder.description(description);
    }
    if let Some(url) = reader.optional_text("url")? {
      builder.url = Some(url);
    }
    if let Some(repo) = reader.optional_text("repo")? {
      builder.repo = repo;
    }
    builder.metadata = reader.text_map("metadata")?;

    for (input_name, value) in reader.map("input")? {
      let decl = match value {
        Value::Str(path) => InputDecl::path(input_name, path),
        Value::Instance(instance) => InputDecl::instance(input_name, instance),
        other => {
          return Err(RecipeError::InvalidAttr {
            recipe: name.clone(),
            attr: format!("input.{input_name}"),
            expected: "a path or an instance",
            found: other.type_name(),
          });
        }
      };
      builder.inputs.push(decl);
    }

    for dep in reader.recipes("dependencies", namespace, constraints)? {
      builder = builder.depends_on(dep);
    }
    for dep in reader.recipes("explicit_dependencies", namespace, constraints)? {
      builder = builder.explicit(dep);
    }

    builder.install = reader.phase("install")?;
    builder.post_install = reader.phase("post_install")?;
    builder.hook = reader.phase("hook")?;

    builder.build()
  }

  /// Wraps an instance so it can be depended on like any other package.
  pub fn from_instance(instance: &Instance, namespace: &str, constraints: &Constraints) -> Result<Recipe, RecipeError> {
    let mut builder = RecipeBuilder::new(instance.name.clone(), instance.version.clone())
      .namespace(namespace)
      .constraints(constraints.clone())
      .install(instance.materialize_phase(crate::action::PREFIX));
    for dep in instance.dependencies() {
      builder = builder.depends_on(Arc::clone(dep));
    }
    builder.build()
  }

  /// Inputs with their content sums, computed once.
  pub fn resolved_inputs(&self) -> Result<&[Input], RecipeError> {
    if let Some(inputs) = self.resolved_inputs.get() {
      return Ok(inputs);
    }
    let inputs = self
      .inputs
      .iter()
      .map(|decl| input::resolve_input(&self.name, decl, &self.source_dir))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(self.resolved_inputs.get_or_init(|| inputs))
  }

  pub fn is_explicit(&self, id: &PackageId) -> bool {
    self
      .explicit_dependencies
      .iter()
      .any(|d| d.id().is_ok_and(|dep_id| dep_id == id))
  }
}

/// Incremental construction of a [`Recipe`].
#[derive(Debug, Default)]
pub struct RecipeBuilder {
  name: String,
  version: String,
  description: String,
  url: Option<String>,
  metadata: BTreeMap<String, String>,
  namespace: String,
  repo: String,
  constraints: Constraints,
  dependencies: Vec<Arc<Recipe>>,
  explicit_dependencies: Vec<Arc<Recipe>>,
  inputs: Vec<InputDecl>,
  install: Option<Phase>,
  post_install: Option<Phase>,
  hook: Option<Phase>,
  source_dir: PathBuf,
}

impl RecipeBuilder {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      repo: DEFAULT_REPO.to_string(),
      ..Self::default()
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  pub fn repo(mut self, repo: impl Into<String>) -> Self {
    self.repo = repo.into();
    self
  }

  pub fn constraints(mut self, constraints: Constraints) -> Self {
    self.constraints = constraints;
    self
  }

  pub fn constraint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.constraints.insert(key.into(), value.into());
    self
  }

  pub fn depends_on(mut self, dep: Arc<Recipe>) -> Self {
    self.dependencies.push(dep);
    self
  }

  pub fn explicit(mut self, dep: Arc<Recipe>) -> Self {
    self.explicit_dependencies.push(dep);
    self
  }

  pub fn input(mut self, decl: InputDecl) -> Self {
    self.inputs.push(decl);
    self
  }

  pub fn install(mut self, phase: Phase) -> Self {
    self.install = Some(phase);
    self
  }

  pub fn post_install(mut self, phase: Phase) -> Self {
    self.post_install = Some(phase);
    self
  }

  pub fn hook(mut self, phase: Phase) -> Self {
    self.hook = Some(phase);
    self
  }

  pub fn source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.source_dir = dir.into();
    self
  }

  /// Merges explicit dependencies into the dependency list and removes duplicates by ID.
  pub fn build(self) -> Result<Recipe, RecipeError> {
    let dependencies = unique_by_id(&self.name, self.dependencies.iter().chain(&self.explicit_dependencies))?;
    let explicit_dependencies = unique_by_id(&self.name, self.explicit_dependencies.iter())?;

    Ok(Recipe {
      name: self.name,
      version: self.version,
      description: self.description,
      url: self.url,
      metadata: self.metadata,
      namespace: self.namespace,
      repo: self.repo,
      constraints: self.constraints,
      dependencies,
      explicit_dependencies,
      inputs: self.inputs,
      install: self.install,
      post_install: self.post_install,
      hook: self.hook,
      source_dir: self.source_dir,
      resolved_inputs: OnceLock::new(),
      identity: OnceLock::new(),
    })
  }
}

fn unique_by_id<'a>(
  recipe: &str,
  deps: impl Iterator<Item = &'a Arc<Recipe>>,
) -> Result<Vec<Arc<Recipe>>, RecipeError> {
  let mut seen = HashSet::new();
  let mut unique = Vec::new();
  for dep in deps {
    let id = dep.id().map_err(|e| RecipeError::Dependency {
      recipe: recipe.to_string(),
      dependency: dep.name.clone(),
      source: Box::new(e),
    })?;
    if seen.insert(id.clone()) {
      unique.push(Arc::clone(dep));
    }
  }
  Ok(unique)
}

/// Typed access to a definition's attributes.
struct AttrReader<'a> {
  source: &'a dyn Attrs,
  recipe: &'a str,
}

impl AttrReader<'_> {
  fn invalid(&self, attr: &str, expected: &'static str, found: &Value) -> RecipeError {
    RecipeError::InvalidAttr {
      recipe: self.recipe.to_string(),
      attr: attr.to_string(),
      expected,
      found: found.type_name(),
    }
  }

  fn required_text(&self, attr: &str) -> Result<String, RecipeError> {
    self
      .optional_text(attr)?
      .filter(|s| !s.is_empty())
      .ok_or_else(|| RecipeError::MissingAttr {
        recipe: self.recipe.to_string(),
        attr: attr.to_string(),
      })
  }

  fn optional_text(&self, attr: &str) -> Result<Option<String>, RecipeError> {
    let value = self.source.attr(attr)?;
    if value.is_nil() {
      return Ok(None);
    }
    value.as_text().map(Some).ok_or_else(|| self.invalid(attr, "a string", &value))
  }

  fn map(&self, attr: &str) -> Result<BTreeMap<String, Value>, RecipeError> {
    match self.source.attr(attr)? {
      Value::Nil => Ok(BTreeMap::new()),
      Value::Map(map) => Ok(map),
      other => Err(self.invalid(attr, "a map", &other)),
    }
  }

  fn text_map(&self, attr: &str) -> Result<BTreeMap<String, String>, RecipeError> {
    self
      .map(attr)?
      .into_iter()
      .map(|(k, v)| match v.as_text() {
        Some(text) => Ok((k, text)),
        None => Err(self.invalid(&format!("{attr}.{k}"), "a string", &v)),
      })
      .collect()
  }

  fn phase(&self, attr: &str) -> Result<Option<Phase>, RecipeError> {
    match self.source.attr(attr)? {
      Value::Nil => Ok(None),
      Value::Phase(phase) => Ok(Some(phase)),
      other => Err(self.invalid(attr, "a phase", &other)),
    }
  }

  /// A list of recipes; instances are promoted to recipes.
  fn recipes(&self, attr: &str, namespace: &str, constraints: &Constraints) -> Result<Vec<Arc<Recipe>>, RecipeError> {
    let items = match self.source.attr(attr)? {
      Value::Nil => return Ok(Vec::new()),
      Value::List(items) => items,
      other => return Err(self.invalid(attr, "a list", &other)),
    };
    items
      .into_iter()
      .map(|item| match item {
        Value::Recipe(recipe) => Ok(recipe),
        Value::Instance(instance) => Recipe::from_instance(&instance, namespace, constraints).map(Arc::new),
        other => Err(self.invalid(attr, "a list of recipes or instances", &other)),
      })
      .collect()
  }
}
