//! Turning requested recipes into an ordered install plan.
//!
//! Resolution makes three passes:
//!
//! - **gather** walks the requested recipes breadth-first. An installed package
//!   contributes only the dependencies its `.pkg-info.json` records as runtime
//!   dependencies; anything else contributes all of its declared dependencies.
//! - **substitute** asks an [`ArchiveSource`] for a prebuilt archive of every
//!   package not yet installed, on a fixed pool of workers.
//! - **plan** walks the graph again from the requested set. A package with an
//!   archive takes the archive's dependency list instead of the recipe's. The
//!   result is sorted so dependencies come before their dependents.
//!
//! An uninstalled package's runtime dependencies are not knowable before it is
//! built, so the plan keeps the conservative (declared) edge set for it. The
//! narrower recorded set takes effect the next time the package is resolved.

pub mod source;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::car::CarInfo;
use crate::consts::DEFAULT_SUBSTITUTE_CONCURRENCY;
use crate::recipe::Recipe;
use crate::signature::SignatureError;
use crate::store::{Store, StoreError};
use crate::util::hash::PackageId;

pub use source::{ArchiveSource, DirArchiveSource, LookupError, NoSubstitutes};

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error(transparent)]
  Signature(#[from] SignatureError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lookup(#[from] LookupError),

  #[error("{dependent} depends on {id}, which is neither installed nor available as an archive")]
  UnresolvedArchiveDependency { id: PackageId, dependent: PackageId },

  #[error("dependency cycle among: {}", .0.iter().map(PackageId::as_str).collect::<Vec<_>>().join(", "))]
  Cycle(Vec<PackageId>),

  #[error("substitution worker failed: {0}")]
  Task(String),
}

/// How a planned package gets into the store.
#[derive(Debug, Clone)]
pub enum Installer {
  /// Already present; nothing to do.
  Installed,
  /// Built from its recipe.
  Build(Arc<Recipe>),
  /// Unpacked from a signed archive.
  Archive(CarInfo),
}

#[derive(Debug, Clone)]
pub struct PlannedPackage {
  pub id: PackageId,
  pub installer: Installer,
  /// Dependencies that must be installed first.
  pub runtime_deps: Vec<PackageId>,
  pub installed: bool,
  /// The store entry this package occupies or will occupy.
  pub target: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct PackagePlan {
  pub requested: Vec<PackageId>,
  /// Every planned package, dependencies before dependents.
  pub order: Vec<PackageId>,
  pub packages: BTreeMap<PackageId, PlannedPackage>,
}

impl PackagePlan {
  pub fn get(&self, id: &PackageId) -> Option<&PlannedPackage> {
    self.packages.get(id)
  }

  /// Planned packages in install order.
  pub fn iter(&self) -> impl Iterator<Item = &PlannedPackage> {
    self.order.iter().filter_map(|id| self.packages.get(id))
  }

  /// Packages that still need installing, in order.
  pub fn pending(&self) -> impl Iterator<Item = &PlannedPackage> {
    self.iter().filter(|p| !p.installed)
  }
}

#[derive(Debug, Clone)]
pub struct ResolveOptions {
  /// Worker count for the substitution pass.
  pub concurrency: usize,
}

impl Default for ResolveOptions {
  fn default() -> Self {
    Self {
      concurrency: DEFAULT_SUBSTITUTE_CONCURRENCY,
    }
  }
}

/// A package found by the gather pass.
#[derive(Debug)]
struct Candidate {
  recipe: Arc<Recipe>,
  installed: bool,
  edges: Vec<PackageId>,
}

/// Resolves `requested` against `store` and `source` into an install plan.
pub async fn resolve(
  requested: &[Arc<Recipe>],
  store: &Store,
  source: Arc<dyn ArchiveSource>,
  options: &ResolveOptions,
) -> Result<PackagePlan, ResolveError> {
  let requested_ids = requested
    .iter()
    .map(|r| r.id().cloned())
    .collect::<Result<Vec<_>, _>>()?;

  let candidates = gather(requested, store)?;
  let missing: Vec<PackageId> = candidates
    .iter()
    .filter(|(_, c)| !c.installed)
    .map(|(id, _)| id.clone())
    .collect();
  let archives = substitute(missing, Arc::clone(&source), options.concurrency).await?;
  let plan = plan(requested_ids, &candidates, archives, store, source.as_ref()).await?;

  info!(
    requested = plan.requested.len(),
    packages = plan.order.len(),
    pending = plan.pending().count(),
    "resolved install plan"
  );
  Ok(plan)
}

fn gather(requested: &[Arc<Recipe>], store: &Store) -> Result<BTreeMap<PackageId, Candidate>, ResolveError> {
  let mut candidates = BTreeMap::new();
  let mut queue: VecDeque<Arc<Recipe>> = requested.iter().cloned().collect();

  while let Some(recipe) = queue.pop_front() {
    let id = recipe.id()?.clone();
    if candidates.contains_key(&id) {
      continue;
    }

    // Entries without a record are unfinished builds and get rebuilt.
    let keep: Option<BTreeSet<PackageId>> = match store.read_info(&id) {
      Ok(info) => Some(info.runtime_deps.into_iter().collect()),
      Err(e) if e.is_not_found() => None,
      Err(e) => return Err(e.into()),
    };
    let installed = keep.is_some();

    let mut edges = Vec::new();
    for dep in &recipe.dependencies {
      let dep_id = dep.id()?.clone();
      if keep.as_ref().is_some_and(|keep| !keep.contains(&dep_id)) {
        continue;
      }
      edges.push(dep_id);
      queue.push_back(Arc::clone(dep));
    }

    debug!(id = %id, installed, edges = edges.len(), "gathered package");
    candidates.insert(
      id,
      Candidate {
        recipe,
        installed,
        edges,
      },
    );
  }

  info!(candidates = candidates.len(), "gather pass complete");
  Ok(candidates)
}

async fn substitute(
  ids: Vec<PackageId>,
  source: Arc<dyn ArchiveSource>,
  concurrency: usize,
) -> Result<HashMap<PackageId, CarInfo>, ResolveError> {
  let workers = concurrency.max(1).min(ids.len());
  let total = ids.len();
  let queue = Arc::new(Mutex::new(VecDeque::from(ids)));
  let found = Arc::new(Mutex::new(HashMap::new()));

  let mut set = JoinSet::new();
  for _ in 0..workers {
    let queue = Arc::clone(&queue);
    let found = Arc::clone(&found);
    let source = Arc::clone(&source);
    set.spawn(async move {
      loop {
        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let Some(id) = next else { break };
        match source.lookup(&id).await {
          Ok(info) => {
            debug!(id = %id, source = source.name(), "substitute found");
            found.lock().unwrap_or_else(PoisonError::into_inner).insert(id, info);
          }
          Err(e) if e.is_not_found() => {}
          Err(e) => return Err(ResolveError::Lookup(e)),
        }
      }
      Ok(())
    });
  }

  while let Some(joined) = set.join_next().await {
    let outcome = joined.map_err(|e| ResolveError::Task(e.to_string())).and_then(|r| r);
    if let Err(e) = outcome {
      set.abort_all();
      return Err(e);
    }
  }

  let found = std::mem::take(&mut *found.lock().unwrap_or_else(PoisonError::into_inner));
  info!(queried = total, substitutes = found.len(), "substitute pass complete");
  Ok(found)
}

async fn plan(
  requested: Vec<PackageId>,
  candidates: &BTreeMap<PackageId, Candidate>,
  mut archives: HashMap<PackageId, CarInfo>,
  store: &Store,
  source: &dyn ArchiveSource,
) -> Result<PackagePlan, ResolveError> {
  let mut packages = BTreeMap::new();
  // Each entry carries the package that pulled it in; requested roots name themselves.
  let mut stack: Vec<(PackageId, PackageId)> = requested.iter().rev().map(|id| (id.clone(), id.clone())).collect();

  while let Some((id, dependent)) = stack.pop() {
    if packages.contains_key(&id) {
      continue;
    }

    let candidate = candidates.get(&id);
    let installed = candidate.map(|c| c.installed).unwrap_or_else(|| store.is_installed(&id));
    let (installer, deps) = if installed {
      let deps = match candidate {
        Some(c) => c.edges.clone(),
        None => store.read_info(&id)?.runtime_deps,
      };
      (Installer::Installed, deps)
    } else if let Some(info) = archives.remove(&id) {
      let deps = info.dependency_ids();
      (Installer::Archive(info), deps)
    } else if let Some(c) = candidate {
      (Installer::Build(Arc::clone(&c.recipe)), c.edges.clone())
    } else {
      match source.lookup(&id).await {
        Ok(info) => {
          let deps = info.dependency_ids();
          (Installer::Archive(info), deps)
        }
        Err(e) if e.is_not_found() => {
          return Err(ResolveError::UnresolvedArchiveDependency { id, dependent });
        }
        Err(e) => return Err(e.into()),
      }
    };

    let target = if installed {
      store.lookup(&id)?
    } else {
      store.entry_path(&id)
    };
    for dep in deps.iter().rev() {
      stack.push((dep.clone(), id.clone()));
    }
    packages.insert(
      id.clone(),
      PlannedPackage {
        id,
        installer,
        runtime_deps: deps,
        installed,
        target,
      },
    );
  }

  let order = topological_order(&packages)?;
  info!(packages = order.len(), "plan pass complete");
  Ok(PackagePlan {
    requested,
    order,
    packages,
  })
}

/// Kahn's algorithm over "dependent -> dependency" edges.
///
/// In-degree counts a node's dependents that have not been emitted yet. Emission
/// starts from packages nothing depends on and ends at leaves, so the result is
/// reversed. Ready nodes are taken in ID order.
fn topological_order(packages: &BTreeMap<PackageId, PlannedPackage>) -> Result<Vec<PackageId>, ResolveError> {
  let mut dependents: BTreeMap<&PackageId, usize> = packages.keys().map(|id| (id, 0)).collect();
  for package in packages.values() {
    for dep in &package.runtime_deps {
      if let Some(count) = dependents.get_mut(dep) {
        *count += 1;
      }
    }
  }

  let mut ready: BTreeSet<&PackageId> = dependents
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(id, _)| *id)
    .collect();
  let mut emitted = Vec::with_capacity(packages.len());

  while let Some(id) = ready.pop_first() {
    emitted.push(id.clone());
    for dep in &packages[id].runtime_deps {
      if let Some(count) = dependents.get_mut(dep) {
        *count -= 1;
        if *count == 0 {
          ready.insert(dep);
        }
      }
    }
  }

  if emitted.len() < packages.len() {
    let stuck = dependents
      .into_iter()
      .filter(|(_, count)| *count > 0)
      .map(|(id, _)| id.clone())
      .collect();
    return Err(ResolveError::Cycle(stuck));
  }

  emitted.reverse();
  Ok(emitted)
}
