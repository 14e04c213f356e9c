use std::sync::Arc;

use kiln_lib::gc::{collect_garbage, mark, sweep};
use kiln_lib::install::create_profile;
use kiln_lib::resolve::{Installer, NoSubstitutes};
use kiln_lib::store::PkgInfo;

use super::common::{TestEnv, leaf_recipe};

/// `app` depends on `lib` without referencing it; `tool` writes lib's path into its output.
fn setup() -> TestEnv {
  let env = TestEnv::new();
  env.write_recipe("lib", &leaf_recipe("lib", "library"));
  env.write_recipe(
    "app",
    r#"
return {
  name = "app",
  version = "1",
  dependencies = { kiln.dep("lib") },
  install = function(ctx)
    ctx:mkdir(ctx.prefix .. "/bin")
    ctx:write(ctx.prefix .. "/bin/app", '#!/bin/sh\necho app\n', true)
  end,
}
"#,
  );
  env.write_recipe(
    "tool",
    r#"
return {
  name = "tool",
  version = "1",
  dependencies = { kiln.dep("lib") },
  install = function(ctx)
    ctx:mkdir(ctx.prefix .. "/etc")
    ctx:write(ctx.prefix .. "/etc/lib-path", ctx:dep("lib") .. "/share/lib")
  end,
}
"#,
  );
  env
}

#[tokio::test]
async fn dependencies_install_first() {
  let env = setup();
  let app = env.load("app");
  let lib = env.load("lib");

  let order = env.install_from_source(&[app.clone()]).await;
  assert_eq!(order, vec![lib.id().unwrap().clone(), app.id().unwrap().clone()]);

  let entry = env.store.lookup(lib.id().unwrap()).unwrap();
  assert_eq!(std::fs::read_to_string(entry.join("share/lib")).unwrap(), "library");
}

#[tokio::test]
async fn runtime_deps_follow_references() {
  let env = setup();
  let loader = env.loader();
  let app = loader.load("app").unwrap();
  let tool = loader.load("tool").unwrap();
  let lib = loader.load("lib").unwrap();
  env.install_from_source(&[app.clone(), tool.clone()]).await;

  let app_info = env.store.read_info(app.id().unwrap()).unwrap();
  let tool_info = env.store.read_info(tool.id().unwrap()).unwrap();
  assert_eq!(app_info.declared_deps, vec![lib.id().unwrap().clone()]);
  assert!(app_info.runtime_deps.is_empty());
  assert_eq!(tool_info.runtime_deps, vec![lib.id().unwrap().clone()]);

  let written = std::fs::read_to_string(env.store.lookup(tool.id().unwrap()).unwrap().join("etc/lib-path")).unwrap();
  assert!(written.starts_with(env.store.active().to_str().unwrap()));
}

#[tokio::test]
async fn gc_keeps_exactly_what_roots_reach() {
  let env = setup();
  let loader = env.loader();
  let app = loader.load("app").unwrap();
  let tool = loader.load("tool").unwrap();
  let lib = loader.load("lib").unwrap();
  env.install_from_source(&[app.clone(), tool.clone()]).await;

  create_profile(
    &env.store,
    &env.profiles_dir(),
    &env.roots_dir(),
    "default",
    &[tool.id().unwrap().clone()],
  )
  .unwrap();

  let reachable = mark(&env.store, &env.roots_dir()).unwrap();
  assert_eq!(
    reachable.into_iter().collect::<Vec<_>>(),
    {
      let mut ids = vec![tool.id().unwrap().clone(), lib.id().unwrap().clone()];
      ids.sort();
      ids
    }
  );

  let result = collect_garbage(&env.store, &env.roots_dir(), false).unwrap();
  assert_eq!(result.stats.deleted, 1);
  assert_eq!(result.deleted_paths, vec![env.store.entry_path(app.id().unwrap())]);
  assert!(env.store.is_installed(lib.id().unwrap()));
  assert!(!env.store.is_installed(app.id().unwrap()));
}

#[tokio::test]
async fn installed_packages_prune_unreferenced_deps() {
  let env = setup();
  let app = env.load("app");
  let lib = env.load("lib");
  env.install_from_source(&[app.clone()]).await;

  create_profile(
    &env.store,
    &env.profiles_dir(),
    &env.roots_dir(),
    "default",
    &[app.id().unwrap().clone()],
  )
  .unwrap();
  let reachable = mark(&env.store, &env.roots_dir()).unwrap();
  assert_eq!(sweep(&env.store, &reachable).unwrap(), vec![lib.id().unwrap().clone()]);
  collect_garbage(&env.store, &env.roots_dir(), false).unwrap();

  // lib is gone, but app never needed it at runtime, so nothing is rebuilt.
  let plan = env.plan(&[app.clone()], Arc::new(NoSubstitutes)).await;
  assert_eq!(plan.order, vec![app.id().unwrap().clone()]);
  assert!(matches!(plan.get(app.id().unwrap()).unwrap().installer, Installer::Installed));
  assert_eq!(plan.pending().count(), 0);
}

#[tokio::test]
async fn reinstalling_is_a_no_op() {
  let env = setup();
  let app = env.load("app");
  env.install_from_source(&[app.clone()]).await;
  let before = env.store.read_info(app.id().unwrap()).unwrap();

  let plan = env.plan(&[app.clone()], Arc::new(NoSubstitutes)).await;
  assert_eq!(plan.pending().count(), 0);
  let after: PkgInfo = env.store.read_info(app.id().unwrap()).unwrap();
  assert_eq!(before, after);
}
