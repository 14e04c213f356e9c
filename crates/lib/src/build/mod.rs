//! Building a recipe into the store.
//!
//! A build runs in a scratch directory and writes into `<store>/<id>`:
//!
//! 1. inputs are materialised into `<build>/inputs/<name>`
//! 2. the install phase, then the post-install phase, run with `prefix` set to the entry
//! 3. the entry is scanned for store references to decide its runtime dependencies
//! 4. `.pkg-info.json` is written and the entry is frozen
//! 5. the hook phase runs
//!
//! If any step fails the entry is removed; dependencies installed earlier are kept.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::car::scan::scan_tree;
use crate::execute::actions::fs::install as copy_input;
use crate::execute::{ExecContext, ExecuteError, Executor, RunState};
use crate::platform::immutable::{self, ImmutableError};
use crate::recipe::{Input, InputKind, Recipe, RecipeError};
use crate::signature::SignatureError;
use crate::store::{PkgInfo, Store, StoreError};
use crate::util::hash::PackageId;

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Signature(#[from] SignatureError),

  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Immutable(#[from] ImmutableError),

  #[error("dependency {0} is not installed")]
  MissingDependency(PackageId),

  #[error("input '{input}': {source}")]
  Input {
    input: String,
    #[source]
    source: ExecuteError,
  },

  #[error("{phase} phase failed: {source}")]
  Phase {
    phase: &'static str,
    #[source]
    source: ExecuteError,
  },

  #[error("failed to {op} {path}: {source}")]
  Io {
    op: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl BuildError {
  fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
    BuildError::Io {
      op,
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
  pub state: RunState,
  /// Parent of scratch build directories; the system temp dir when unset.
  pub build_root: Option<PathBuf>,
}

/// Builds `recipe` into `store` unless it is already there.
///
/// All dependencies must already be installed. Returns the entry's package info.
pub async fn realize(recipe: &Recipe, store: &Store, options: &BuildOptions) -> Result<PkgInfo, BuildError> {
  let id = recipe.id()?.clone();

  if let Ok(existing) = store.lookup(&id) {
    match store.read_info(&id) {
      Ok(info) => {
        debug!(id = %id, path = ?existing, "already installed");
        return Ok(info);
      }
      Err(e) if e.is_not_found() && existing.starts_with(store.active()) => {
        debug!(id = %id, path = ?existing, "incomplete entry found, removing");
        immutable::remove_entry(&existing)?;
      }
      Err(e) => return Err(e.into()),
    }
  }

  let target = store.entry_path(&id);
  info!(id = %id, path = ?target, "building");
  std::fs::create_dir_all(&target).map_err(|e| BuildError::io("create", &target, e))?;

  match build_into(recipe, &id, &target, store, options).await {
    Ok(info) => {
      info!(id = %id, runtime_deps = info.runtime_deps.len(), "build complete");
      Ok(info)
    }
    Err(err) => {
      error!(id = %id, error = %err, "build failed");
      if let Err(e) = immutable::remove_entry(&target) {
        warn!(path = ?target, error = %e, "failed to remove partial build");
      }
      Err(err)
    }
  }
}

async fn build_into(
  recipe: &Recipe,
  id: &PackageId,
  target: &Path,
  store: &Store,
  options: &BuildOptions,
) -> Result<PkgInfo, BuildError> {
  let scratch = scratch_dir(options)?;
  let build = scratch.path();

  let mut build_deps = Vec::new();
  let mut ctx = ExecContext::for_build(target, build, &recipe.source_dir);
  for dep in &recipe.dependencies {
    let dep_id = dep.id()?.clone();
    let location = store
      .lookup(&dep_id)
      .map_err(|_| BuildError::MissingDependency(dep_id.clone()))?;
    ctx = ctx.with_dep(dep.name.clone(), location.display().to_string());
    build_deps.push(dep_id);
  }

  let inputs = recipe.resolved_inputs()?;
  for input in inputs {
    let location = materialize_input(recipe, input, build, store, &options.state).await?;
    ctx = ctx.with_input(input.name.clone(), location.display().to_string());
  }

  let mut executor = Executor::running(ctx, options.state.clone());
  if let Some(phase) = &recipe.install {
    executor
      .execute(phase)
      .await
      .map_err(|source| BuildError::Phase { phase: "install", source })?;
  }
  if let Some(phase) = &recipe.post_install {
    executor
      .execute(phase)
      .await
      .map_err(|source| BuildError::Phase {
        phase: "post_install",
        source,
      })?;
  }

  let referenced = scan_references(target, store, id)?;
  let explicit: BTreeSet<PackageId> = recipe
    .explicit_dependencies
    .iter()
    .map(|d| d.id().cloned())
    .collect::<Result<_, _>>()?;
  let runtime_deps = build_deps
    .iter()
    .filter(|d| referenced.contains(*d) || explicit.contains(*d))
    .cloned()
    .collect();
  debug!(id = %id, referenced = referenced.len(), "scanned store references");

  let info = PkgInfo {
    id: id.clone(),
    name: recipe.name.clone(),
    version: recipe.version.clone(),
    repo: recipe.repo.clone(),
    declared_deps: build_deps.clone(),
    runtime_deps,
    build_deps,
    constraints: recipe.constraints.clone(),
    inputs: inputs.iter().map(Input::record).collect(),
  };
  info.write(target)?;
  immutable::freeze(target)?;

  if let Some(phase) = &recipe.hook {
    executor
      .execute(phase)
      .await
      .map_err(|source| BuildError::Phase { phase: "hook", source })?;
  }

  Ok(info)
}

fn scratch_dir(options: &BuildOptions) -> Result<tempfile::TempDir, BuildError> {
  let mut builder = tempfile::Builder::new();
  builder.prefix("kiln-build-");
  match &options.build_root {
    Some(root) => {
      std::fs::create_dir_all(root).map_err(|e| BuildError::io("create", root, e))?;
      builder.tempdir_in(root).map_err(|e| BuildError::io("create", root, e))
    }
    None => builder
      .tempdir()
      .map_err(|e| BuildError::io("create", &std::env::temp_dir(), e)),
  }
}

/// Places `input` under `<build>/inputs/<name>` and returns the path phases see.
async fn materialize_input(
  recipe: &Recipe,
  input: &Input,
  build: &Path,
  store: &Store,
  state: &RunState,
) -> Result<PathBuf, BuildError> {
  let dest = build.join("inputs").join(&input.name);
  let wrap = |source| BuildError::Input {
    input: input.name.clone(),
    source,
  };

  match (&input.kind, &input.path, &input.instance) {
    (InputKind::File | InputKind::Directory, Some(src), _) => {
      if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BuildError::io("create", parent, e))?;
      }
      copy_input(src, &dest, false).map_err(wrap)?;
      Ok(dest)
    }
    (InputKind::Instance, _, Some(instance)) => {
      let mut ctx = ExecContext::for_build(&dest, build, &recipe.source_dir);
      for dep in instance.dependencies() {
        let dep_id = dep.id()?.clone();
        let location = store
          .lookup(&dep_id)
          .map_err(|_| BuildError::MissingDependency(dep_id.clone()))?;
        ctx = ctx.with_dep(dep.name.clone(), location.display().to_string());
      }
      std::fs::create_dir_all(&dest).map_err(|e| BuildError::io("create", &dest, e))?;

      let phase = instance.materialize_phase(crate::action::PREFIX);
      Executor::running(ctx, state.clone())
        .execute(&phase)
        .await
        .map_err(wrap)?;
      Ok(match instance.artifact_name() {
        Some(name) => dest.join(name),
        None => dest,
      })
    }
    _ => Err(BuildError::Recipe(RecipeError::InputMissing {
      recipe: recipe.name.clone(),
      input: input.name.clone(),
      path: input.path.clone().unwrap_or_default(),
    })),
  }
}

/// IDs referenced from `target` under any directory of the store chain.
fn scan_references(target: &Path, store: &Store, own: &PackageId) -> Result<BTreeSet<PackageId>, BuildError> {
  let mut found = BTreeSet::new();
  for prefix in store.paths() {
    let refs = scan_tree(target, prefix, Some(own)).map_err(|e| BuildError::io("scan", target, e))?;
    found.extend(refs);
  }
  Ok(found)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{self, PhaseBuilder};
  use crate::recipe::{InputDecl, Instance};
  use std::sync::Arc;
  use tempfile::TempDir;

  fn store(temp: &TempDir) -> Store {
    Store::open(&temp.path().join("store")).unwrap()
  }

  fn options(temp: &TempDir) -> BuildOptions {
    BuildOptions {
      build_root: Some(temp.path().join("builds")),
      ..BuildOptions::default()
    }
  }

  fn writes(path: &str, contents: &str) -> crate::action::Phase {
    let mut ctx = PhaseBuilder::new();
    ctx
      .mkdir(format!("{}/{}", action::PREFIX, Path::new(path).parent().unwrap().display()))
      .write(format!("{}/{path}", action::PREFIX), contents);
    ctx.finish()
  }

  #[tokio::test]
  async fn builds_and_records_info() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let recipe = Recipe::builder("hello", "1.0")
      .install(writes("share/greeting", "hi"))
      .build()
      .unwrap();

    let info = realize(&recipe, &store, &options(&temp)).await.unwrap();
    let entry = store.lookup(recipe.id().unwrap()).unwrap();
    assert_eq!(std::fs::read_to_string(entry.join("share/greeting")).unwrap(), "hi");
    assert_eq!(&info.id, recipe.id().unwrap());
    assert_eq!(PkgInfo::read(&entry).unwrap(), info);
    assert!(std::fs::metadata(entry.join("share/greeting")).unwrap().permissions().readonly());
  }

  #[tokio::test]
  async fn runtime_deps_are_the_referenced_subset() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let opts = options(&temp);

    let used = Arc::new(Recipe::builder("used", "1").install(writes("lib/a", "a")).build().unwrap());
    let unused = Arc::new(Recipe::builder("unused", "1").install(writes("lib/b", "b")).build().unwrap());
    let pinned = Arc::new(Recipe::builder("pinned", "1").install(writes("lib/c", "c")).build().unwrap());
    for dep in [&used, &unused, &pinned] {
      realize(dep, &store, &opts).await.unwrap();
    }

    let app = Recipe::builder("app", "1")
      .depends_on(used.clone())
      .depends_on(unused.clone())
      .explicit(pinned.clone())
      .install(writes("etc/config", &format!("libdir={}/lib", action::dep("used"))))
      .build()
      .unwrap();
    let info = realize(&app, &store, &opts).await.unwrap();

    let mut expected = vec![used.id().unwrap().clone(), pinned.id().unwrap().clone()];
    expected.sort();
    let mut runtime = info.runtime_deps.clone();
    runtime.sort();
    assert_eq!(runtime, expected);
    assert_eq!(info.build_deps.len(), 3);
    assert!(info.runtime_deps.iter().all(|d| info.build_deps.contains(d)));
  }

  #[tokio::test]
  async fn failed_build_leaves_no_entry() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let mut ctx = PhaseBuilder::new();
    ctx
      .mkdir(format!("{}/bin", action::PREFIX))
      .shell("exit 3");
    let recipe = Recipe::builder("broken", "1").install(ctx.finish()).build().unwrap();

    let err = realize(&recipe, &store, &options(&temp)).await.unwrap_err();
    assert!(matches!(err, BuildError::Phase { phase: "install", .. }));
    assert!(!store.entry_path(recipe.id().unwrap()).exists());
  }

  #[tokio::test]
  async fn missing_dependency_is_reported() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let dep = Arc::new(Recipe::builder("dep", "1").build().unwrap());
    let recipe = Recipe::builder("app", "1").depends_on(dep.clone()).build().unwrap();

    let err = realize(&recipe, &store, &options(&temp)).await.unwrap_err();
    assert!(matches!(err, BuildError::MissingDependency(ref id) if id == dep.id().unwrap()));
  }

  #[tokio::test]
  async fn installed_entry_is_reused() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let recipe = Recipe::builder("once", "1").install(writes("x/y", "1")).build().unwrap();
    let first = realize(&recipe, &store, &options(&temp)).await.unwrap();
    let second = realize(&recipe, &store, &options(&temp)).await.unwrap();
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn incomplete_entry_is_rebuilt() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let recipe = Recipe::builder("partial", "1").install(writes("x/y", "1")).build().unwrap();
    let entry = store.entry_path(recipe.id().unwrap());
    std::fs::create_dir_all(entry.join("junk")).unwrap();

    realize(&recipe, &store, &options(&temp)).await.unwrap();
    assert!(!entry.join("junk").exists());
    assert!(entry.join("x/y").exists());
  }

  #[tokio::test]
  async fn inputs_are_materialized() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let recipes = temp.path().join("recipes");
    std::fs::create_dir_all(&recipes).unwrap();
    std::fs::write(recipes.join("motd"), "welcome").unwrap();

    let mut ctx = PhaseBuilder::new();
    ctx
      .mkdir(format!("{}/etc", action::PREFIX))
      .install(action::input("motd"), format!("{}/etc/motd", action::PREFIX))
      .install(action::input("script"), format!("{}/etc/script", action::PREFIX));
    let recipe = Recipe::builder("motd", "1")
      .input(InputDecl::path("motd", "motd"))
      .input(InputDecl::instance("script", Arc::new(Instance::file("run.sh", "echo", true))))
      .source_dir(&recipes)
      .install(ctx.finish())
      .build()
      .unwrap();

    let info = realize(&recipe, &store, &options(&temp)).await.unwrap();
    let entry = store.lookup(recipe.id().unwrap()).unwrap();
    assert_eq!(std::fs::read_to_string(entry.join("etc/motd")).unwrap(), "welcome");
    assert_eq!(std::fs::read_to_string(entry.join("etc/script")).unwrap(), "echo");
    assert_eq!(info.inputs.len(), 2);
  }

  #[tokio::test]
  async fn hook_runs_after_freeze() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let marker = temp.path().join("hook-ran");
    let mut hook = PhaseBuilder::new();
    hook.shell(format!("touch {}", marker.display()));
    let recipe = Recipe::builder("hooked", "1")
      .install(writes("a/b", "c"))
      .hook(hook.finish())
      .build()
      .unwrap();

    realize(&recipe, &store, &options(&temp)).await.unwrap();
    assert!(marker.exists());
  }
}
