//! Lua state setup and recipe file loading.
//!
//! Each recipe file gets its own Lua state with `require` rooted at the
//! repository and the `kiln` global installed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mlua::prelude::*;
use tracing::debug;

use crate::consts::DEFAULT_REPO;
use crate::platform::HostPlatform;
use crate::recipe::{Constraints, Prototype, Recipe, RecipeCache, RecipeError, RecipeKey};

use super::convert::to_prototype;
use super::globals;

/// Loads recipe files from a repository directory.
///
/// `kiln.dep("zlib")` resolves to `<dir>/zlib.lua` or `<dir>/zlib/init.lua`.
/// Clones share one [`RecipeCache`], so each recipe is evaluated once per
/// session and dependency cycles are reported instead of recursing forever.
#[derive(Debug, Clone)]
pub struct LuaLoader {
  dir: PathBuf,
  namespace: String,
  constraints: Constraints,
  cache: Arc<RecipeCache>,
}

impl LuaLoader {
  /// A loader for `dir` constrained to the host platform.
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      namespace: DEFAULT_REPO.to_string(),
      constraints: HostPlatform::detect().constraints(),
      cache: Arc::new(RecipeCache::new()),
    }
  }

  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  pub fn with_constraints(mut self, constraints: Constraints) -> Self {
    self.constraints = constraints;
    self
  }

  pub fn with_cache(mut self, cache: Arc<RecipeCache>) -> Self {
    self.cache = cache;
    self
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn constraints(&self) -> &Constraints {
    &self.constraints
  }

  pub fn cache(&self) -> &RecipeCache {
    &self.cache
  }

  pub fn load(&self, name: &str) -> Result<Arc<Recipe>, RecipeError> {
    self.load_with_args(name, BTreeMap::new())
  }

  /// Loads `name` through the cache; `args` are passed to files that return a function.
  pub fn load_with_args(&self, name: &str, args: BTreeMap<String, String>) -> Result<Arc<Recipe>, RecipeError> {
    let key = RecipeKey::new(name, &self.namespace, &self.constraints).with_args(args.clone());
    self.cache.get_or_load(key, || {
      let path = self.locate(name)?;
      self.load_file(&path, &args)
    })
  }

  /// Evaluates a single recipe file, bypassing the cache for the file itself.
  pub fn load_file(&self, path: &Path, args: &BTreeMap<String, String>) -> Result<Recipe, RecipeError> {
    let load_error = |message: String| RecipeError::Load {
      name: path.display().to_string(),
      message,
    };

    let path = dunce::canonicalize(path).map_err(|e| load_error(format!("cannot canonicalize: {e}")))?;
    let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();

    let lua = create_runtime(self, &dir).map_err(|e| load_error(e.to_string()))?;
    let proto = evaluate(&lua, &path, args).map_err(|e| load_error(e.to_string()))?;
    let recipe = Recipe::from_attrs(&proto, &dir, &self.namespace, &self.constraints)?;
    debug!(recipe = %recipe.name, path = ?path, "loaded recipe file");
    Ok(recipe)
  }

  fn locate(&self, name: &str) -> Result<PathBuf, RecipeError> {
    let not_found = |message: String| RecipeError::Load {
      name: name.to_string(),
      message,
    };
    if name.is_empty() || name.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
      return Err(not_found("invalid recipe name".to_string()));
    }

    [
      self.dir.join(format!("{name}.lua")),
      self.dir.join(name).join("init.lua"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
    .ok_or_else(|| not_found(format!("no recipe file in {}", self.dir.display())))
  }
}

/// A fresh Lua state with the `kiln` global and `require` rooted at the repository.
pub fn create_runtime(loader: &LuaLoader, dir: &Path) -> LuaResult<Lua> {
  let lua = Lua::new();
  let package: LuaTable = lua.globals().get("package")?;
  let package_path = package.get::<String>("path")?;
  let root = loader.dir.display();
  package.set("path", format!("{root}/?.lua;{root}/?/init.lua;{package_path}"))?;

  globals::register_globals(&lua, loader, dir)?;
  Ok(lua)
}

/// Runs a recipe file. It must return a definition table, or a function taking
/// the argument table and returning one.
fn evaluate(lua: &Lua, path: &Path, args: &BTreeMap<String, String>) -> LuaResult<Prototype> {
  let content = std::fs::read_to_string(path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", path.display(), e)))?;

  let result = lua
    .load(&content)
    .set_name(format!("@{}", path.display()))
    .eval::<LuaValue>()?;

  let table = match result {
    LuaValue::Table(table) => table,
    LuaValue::Function(func) => func.call::<LuaTable>(lua.create_table_from(args.clone())?)?,
    other => {
      return Err(LuaError::external(format!(
        "recipe file must return a table or a function, got {}",
        other.type_name()
      )));
    }
  };
  to_prototype(lua, table)
}
