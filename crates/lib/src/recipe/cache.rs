//! Session-scoped cache of loaded recipes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use super::{Constraints, Recipe, RecipeError};

/// What a loaded recipe is keyed by: the same definition loaded with different
/// arguments or constraints is a different recipe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecipeKey {
  pub name: String,
  pub namespace: String,
  pub args: BTreeMap<String, String>,
  pub constraints: Constraints,
}

impl RecipeKey {
  pub fn new(name: impl Into<String>, namespace: impl Into<String>, constraints: &Constraints) -> Self {
    Self {
      name: name.into(),
      namespace: namespace.into(),
      args: BTreeMap::new(),
      constraints: constraints.clone(),
    }
  }

  pub fn with_args(mut self, args: BTreeMap<String, String>) -> Self {
    self.args = args;
    self
  }
}

/// Loaded recipes for one resolution session.
///
/// Keys are marked in progress while their loader runs; a loader that asks for its
/// own key again (directly or through other recipes) fails with
/// [`RecipeError::Cycle`].
#[derive(Debug, Default)]
pub struct RecipeCache {
  loaded: Mutex<HashMap<RecipeKey, Arc<Recipe>>>,
  in_progress: Mutex<HashSet<RecipeKey>>,
}

impl RecipeCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &RecipeKey) -> Option<Arc<Recipe>> {
    self
      .loaded
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(key)
      .cloned()
  }

  pub fn len(&self) -> usize {
    self.loaded.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Returns the cached recipe for `key`, running `load` on a miss.
  pub fn get_or_load<F>(&self, key: RecipeKey, load: F) -> Result<Arc<Recipe>, RecipeError>
  where
    F: FnOnce() -> Result<Recipe, RecipeError>,
  {
    if let Some(recipe) = self.get(&key) {
      return Ok(recipe);
    }

    let first_entry = self
      .in_progress
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key.clone());
    if !first_entry {
      return Err(RecipeError::Cycle(format!("{}/{}", key.namespace, key.name)));
    }

    debug!(recipe = %key.name, namespace = %key.namespace, "loading recipe");
    let result = load().map(Arc::new);

    self
      .in_progress
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&key);

    let recipe = result?;
    self
      .loaded
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key, Arc::clone(&recipe));
    Ok(recipe)
  }
}
