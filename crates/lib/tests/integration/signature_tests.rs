use super::common::{TestEnv, leaf_recipe, loader_for};
use kiln_lib::recipe::Constraints;

#[test]
fn same_definition_same_id_anywhere() {
  let a = TestEnv::new();
  let b = TestEnv::new();
  a.write_recipe("zlib", &leaf_recipe("zlib", "z"));
  b.write_recipe("zlib", &leaf_recipe("zlib", "z"));

  let first = a.load("zlib");
  let second = b.load("zlib");
  assert_eq!(first.id().unwrap(), second.id().unwrap());
  assert!(first.id().unwrap().as_str().ends_with("-zlib-1.0"));
}

#[test]
fn phase_arguments_change_the_id() {
  let a = TestEnv::new();
  let b = TestEnv::new();
  a.write_recipe("zlib", &leaf_recipe("zlib", "z"));
  b.write_recipe("zlib", &leaf_recipe("zlib", "patched"));

  assert_ne!(a.load("zlib").id().unwrap(), b.load("zlib").id().unwrap());
}

#[test]
fn dependency_changes_propagate() {
  const APP: &str = r#"
return {
  name = "app",
  version = "1",
  dependencies = { kiln.dep("lib") },
  install = function(ctx) ctx:mkdir(ctx.prefix) end,
}
"#;
  let a = TestEnv::new();
  let b = TestEnv::new();
  for (env, contents) in [(&a, "one"), (&b, "two")] {
    env.write_recipe("lib", &leaf_recipe("lib", contents));
    env.write_recipe("app", APP);
  }

  assert_ne!(a.load("app").id().unwrap(), b.load("app").id().unwrap());
}

#[test]
fn constraints_change_the_id() {
  let env = TestEnv::new();
  env.write_recipe("zlib", &leaf_recipe("zlib", "z"));

  let linux = loader_for(&env.recipes_dir()).load("zlib").unwrap();
  let darwin = loader_for(&env.recipes_dir())
    .with_constraints(Constraints::from([("os".to_string(), "darwin".to_string())]))
    .load("zlib")
    .unwrap();
  assert_ne!(linux.id().unwrap(), darwin.id().unwrap());
}
