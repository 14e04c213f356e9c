//! Recipe signatures and package IDs.
//!
//! A recipe's signature is an order-independent structural hash over:
//!
//! - `name` and `version`
//! - the constraint map
//! - the set of dependency IDs, and separately the set of explicit dependency IDs
//! - the set of input identities (`name:sum_type:sum`)
//! - the digest of the install phase and, when present, the post-install phase
//!
//! Phases are hashed by running them in hash mode against a canonical context
//! where `prefix`, `build` and `top` are fixed tokens, dependencies resolve to
//! their IDs and inputs to their identities. Nothing location-dependent enters the
//! digest. The description, metadata, repository and hook phase are deliberately
//! left out, so editing them never changes the ID.

use thiserror::Error;
use tracing::debug;

use crate::action::Phase;
use crate::execute::{ExecContext, ExecuteError, hash_phase};
use crate::recipe::{Constraints, Recipe, RecipeError};
use crate::util::hash::{Digest32, PackageId, Signature, StructHasher};

#[derive(Debug, Error)]
pub enum SignatureError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error("{recipe}: failed to hash {phase} phase: {source}")]
  Phase {
    recipe: String,
    phase: &'static str,
    #[source]
    source: ExecuteError,
  },

  #[error("{recipe}: dependency '{dependency}': {source}")]
  Dependency {
    recipe: String,
    dependency: String,
    #[source]
    source: Box<SignatureError>,
  },
}

/// Computes the signature and ID of `recipe` under `constraints`.
///
/// Fails if any input cannot be hashed or any dependency has no identity; a partial
/// signature is never returned.
pub fn signature(recipe: &Recipe, constraints: &Constraints) -> Result<(Signature, PackageId), SignatureError> {
  let dep_ids = dependency_ids(recipe, &recipe.dependencies)?;
  let explicit_ids = dependency_ids(recipe, &recipe.explicit_dependencies)?;
  let inputs = recipe.resolved_inputs()?;
  let identities: Vec<String> = inputs.iter().map(|i| i.identity()).collect();

  let mut ctx = ExecContext::canonical();
  for (dep, id) in recipe.dependencies.iter().zip(&dep_ids) {
    ctx = ctx.with_dep(dep.name.clone(), id.to_string());
  }
  for (input, identity) in inputs.iter().zip(&identities) {
    ctx = ctx.with_input(input.name.clone(), identity.clone());
  }

  let install = phase_digest(recipe, "install", recipe.install.as_ref(), &ctx)?;
  let post_install = phase_digest(recipe, "post_install", recipe.post_install.as_ref(), &ctx)?;

  let signature = StructHasher::new()
    .str("name", &recipe.name)
    .str("version", &recipe.version)
    .map("constraints", constraints.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    .set("dependencies", dep_ids.iter().map(PackageId::as_str))
    .set("explicit_dependencies", explicit_ids.iter().map(PackageId::as_str))
    .set("inputs", identities.iter().map(String::as_str))
    .digest("install", install.as_ref())
    .digest("post_install", post_install.as_ref())
    .finish();

  let id = PackageId::new(&signature, &recipe.name, &recipe.version);
  debug!(recipe = %recipe.name, id = %id, "computed signature");
  Ok((signature, id))
}

fn dependency_ids(recipe: &Recipe, deps: &[std::sync::Arc<Recipe>]) -> Result<Vec<PackageId>, SignatureError> {
  deps
    .iter()
    .map(|dep| {
      dep.id().cloned().map_err(|e| SignatureError::Dependency {
        recipe: recipe.name.clone(),
        dependency: dep.name.clone(),
        source: Box::new(e),
      })
    })
    .collect()
}

fn phase_digest(
  recipe: &Recipe,
  phase_name: &'static str,
  phase: Option<&Phase>,
  ctx: &ExecContext,
) -> Result<Option<Digest32>, SignatureError> {
  phase
    .map(|phase| hash_phase(phase, ctx.clone()))
    .transpose()
    .map_err(|source| SignatureError::Phase {
      recipe: recipe.name.clone(),
      phase: phase_name,
      source,
    })
}

impl Recipe {
  /// Signature under the recipe's own constraints, computed once.
  pub fn signature(&self) -> Result<Signature, SignatureError> {
    Ok(self.identity()?.0)
  }

  /// Package ID under the recipe's own constraints, computed once.
  pub fn id(&self) -> Result<&PackageId, SignatureError> {
    Ok(&self.identity()?.1)
  }

  fn identity(&self) -> Result<&(Signature, PackageId), SignatureError> {
    if let Some(identity) = self.identity.get() {
      return Ok(identity);
    }
    let computed = signature(self, &self.constraints)?;
    Ok(self.identity.get_or_init(|| computed))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{self, PhaseBuilder};
  use crate::recipe::{InputDecl, Instance};
  use std::sync::Arc;
  use tempfile::TempDir;

  fn install_phase(script: &str) -> Phase {
    let mut ctx = PhaseBuilder::new();
    ctx.mkdir(format!("{}/bin", action::PREFIX)).shell(script);
    ctx.finish()
  }

  fn leaf(name: &str, script: &str) -> Arc<Recipe> {
    Arc::new(Recipe::builder(name, "1.0").install(install_phase(script)).build().unwrap())
  }

  #[test]
  fn identical_recipes_share_an_id() {
    let a = Recipe::builder("app", "1.0").install(install_phase("make")).build().unwrap();
    let b = Recipe::builder("app", "1.0").install(install_phase("make")).build().unwrap();
    assert_eq!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn id_has_signature_name_version_shape() {
    let recipe = Recipe::builder("zlib", "1.3.1").build().unwrap();
    let id = recipe.id().unwrap();
    assert_eq!(id.as_str(), format!("{}-zlib-1.3.1", recipe.signature().unwrap()));
  }

  #[test]
  fn constraint_insertion_order_is_irrelevant() {
    let a = Recipe::builder("app", "1")
      .constraint("os", "linux")
      .constraint("arch", "x86_64")
      .build()
      .unwrap();
    let b = Recipe::builder("app", "1")
      .constraint("arch", "x86_64")
      .constraint("os", "linux")
      .build()
      .unwrap();
    assert_eq!(a.signature().unwrap(), b.signature().unwrap());

    let c = Recipe::builder("app", "1").constraint("os", "darwin").build().unwrap();
    assert_ne!(a.signature().unwrap(), c.signature().unwrap());
  }

  #[test]
  fn dependency_order_is_irrelevant() {
    let x = leaf("x", "a");
    let y = leaf("y", "b");
    let a = Recipe::builder("app", "1")
      .depends_on(x.clone())
      .depends_on(y.clone())
      .build()
      .unwrap();
    let b = Recipe::builder("app", "1").depends_on(y).depends_on(x).build().unwrap();
    assert_eq!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn dependency_change_propagates() {
    let a = Recipe::builder("app", "1").depends_on(leaf("lib", "v1")).build().unwrap();
    let b = Recipe::builder("app", "1").depends_on(leaf("lib", "v2")).build().unwrap();
    assert_ne!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn bookkeeping_fields_do_not_affect_id() {
    let a = Recipe::builder("app", "1").install(install_phase("make")).build().unwrap();
    let b = Recipe::builder("app", "1")
      .install(install_phase("make"))
      .description("labelled at request time")
      .metadata("homepage", "https://example.com")
      .repo("mirror")
      .hook(install_phase("echo done"))
      .build()
      .unwrap();
    assert_eq!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn post_install_presence_changes_id() {
    let a = Recipe::builder("app", "1").install(install_phase("make")).build().unwrap();
    let b = Recipe::builder("app", "1")
      .install(install_phase("make"))
      .post_install(install_phase("strip"))
      .build()
      .unwrap();
    assert_ne!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn signature_is_location_independent() {
    let a = Recipe::builder("app", "1")
      .install(install_phase("make"))
      .source_dir("/home/alice/recipes")
      .build()
      .unwrap();
    let b = Recipe::builder("app", "1")
      .install(install_phase("make"))
      .source_dir("/srv/recipes")
      .build()
      .unwrap();
    assert_eq!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn input_content_changes_id() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("fix.patch"), "one").unwrap();
    let build = || {
      Recipe::builder("app", "1")
        .input(InputDecl::path("fix", "fix.patch"))
        .source_dir(temp.path())
        .build()
        .unwrap()
    };
    let before = build().id().unwrap().clone();
    std::fs::write(temp.path().join("fix.patch"), "two").unwrap();
    let after = build().id().unwrap().clone();
    assert_ne!(before, after);
  }

  #[test]
  fn missing_input_is_fatal() {
    let temp = TempDir::new().unwrap();
    let recipe = Recipe::builder("app", "1")
      .input(InputDecl::path("fix", "missing.patch"))
      .source_dir(temp.path())
      .build()
      .unwrap();
    assert!(matches!(
      recipe.id(),
      Err(SignatureError::Recipe(RecipeError::InputMissing { .. }))
    ));
  }

  #[test]
  fn phases_may_reference_dependencies_and_inputs() {
    let zlib = leaf("zlib", "make");
    let mut ctx = PhaseBuilder::new();
    ctx
      .shell(format!("./configure --with-zlib={}", action::dep("zlib")))
      .shell(format!("cp {} {}", action::input("conf"), action::PREFIX));
    let recipe = Recipe::builder("app", "1")
      .depends_on(zlib)
      .input(InputDecl::instance("conf", Arc::new(Instance::file("conf", "x", false))))
      .install(ctx.finish())
      .build()
      .unwrap();
    assert!(recipe.id().is_ok());
  }

  #[test]
  fn unknown_dependency_placeholder_is_fatal() {
    let mut ctx = PhaseBuilder::new();
    ctx.shell(format!("ls {}", action::dep("ghost")));
    let recipe = Recipe::builder("app", "1").install(ctx.finish()).build().unwrap();
    assert!(matches!(recipe.id(), Err(SignatureError::Phase { phase: "install", .. })));
  }

  #[test]
  fn explicit_constraints_override() {
    let recipe = Recipe::builder("app", "1").constraint("os", "linux").build().unwrap();
    let darwin = Constraints::from([("os".to_string(), "darwin".to_string())]);
    let (sig, _) = signature(&recipe, &darwin).unwrap();
    assert_ne!(sig, recipe.signature().unwrap());
  }

  #[test]
  fn recomputation_is_idempotent() {
    let recipe = Recipe::builder("app", "1").install(install_phase("make")).build().unwrap();
    let first = signature(&recipe, &recipe.constraints).unwrap();
    let second = signature(&recipe, &recipe.constraints).unwrap();
    assert_eq!(first, second);
    assert_eq!(recipe.id().unwrap(), &first.1);
  }
}
