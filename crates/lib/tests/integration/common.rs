//! Shared helpers for kiln integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_lib::build::BuildOptions;
use kiln_lib::install::{InstallOptions, install};
use kiln_lib::lua::LuaLoader;
use kiln_lib::recipe::{Constraints, Recipe};
use kiln_lib::resolve::{ArchiveSource, NoSubstitutes, PackagePlan, ResolveOptions, resolve};
use kiln_lib::store::Store;
use kiln_lib::util::hash::PackageId;
use tempfile::TempDir;

/// Isolated kiln tree: a recipe repository plus store, roots and profiles.
pub struct TestEnv {
  pub temp: TempDir,
  pub store: Store,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let store = Store::open(&temp.path().join("store")).unwrap();
    std::fs::create_dir_all(temp.path().join("recipes")).unwrap();
    Self { temp, store }
  }

  pub fn recipes_dir(&self) -> PathBuf {
    self.temp.path().join("recipes")
  }

  pub fn roots_dir(&self) -> PathBuf {
    self.temp.path().join("roots")
  }

  pub fn profiles_dir(&self) -> PathBuf {
    self.temp.path().join("profiles")
  }

  /// Writes `recipes/<name>.lua`.
  pub fn write_recipe(&self, name: &str, body: &str) {
    std::fs::write(self.recipes_dir().join(format!("{name}.lua")), body).unwrap();
  }

  /// A fresh loader session over the recipe repository.
  pub fn loader(&self) -> LuaLoader {
    loader_for(&self.recipes_dir())
  }

  pub fn load(&self, name: &str) -> Arc<Recipe> {
    self.loader().load(name).unwrap()
  }

  pub fn options(&self) -> InstallOptions {
    InstallOptions {
      build: BuildOptions {
        build_root: Some(self.temp.path().join("builds")),
        ..BuildOptions::default()
      },
    }
  }

  pub async fn plan(&self, recipes: &[Arc<Recipe>], source: Arc<dyn ArchiveSource>) -> PackagePlan {
    resolve(recipes, &self.store, source, &ResolveOptions::default()).await.unwrap()
  }

  /// Resolves and installs from source, returning the plan order.
  pub async fn install_from_source(&self, recipes: &[Arc<Recipe>]) -> Vec<PackageId> {
    let plan = self.plan(recipes, Arc::new(NoSubstitutes)).await;
    install(&plan, &self.store, &NoSubstitutes, &self.options()).await.unwrap();
    plan.order
  }
}

/// Loader with fixed constraints so IDs do not depend on the test host.
pub fn loader_for(dir: &Path) -> LuaLoader {
  LuaLoader::new(dir).with_constraints(Constraints::from([
    ("os".to_string(), "linux".to_string()),
    ("arch".to_string(), "x86_64".to_string()),
  ]))
}

/// A leaf recipe writing one file into its prefix.
pub fn leaf_recipe(name: &str, contents: &str) -> String {
  format!(
    r#"
return {{
  name = "{name}",
  version = "1.0",
  install = function(ctx)
    ctx:mkdir(ctx.prefix .. "/share")
    ctx:write(ctx.prefix .. "/share/{name}", "{contents}")
  end,
}}
"#
  )
}
