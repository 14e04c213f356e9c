use super::common::TestEnv;

#[tokio::test]
async fn recipe_with_instances_builds_end_to_end() {
  let env = TestEnv::new();
  env.write_recipe(
    "greeter",
    r#"
local motd = kiln.file{ name = "motd", contents = "welcome" }
local helper = kiln.build{
  name = "helper",
  version = "2",
  phase = function(ctx)
    ctx:mkdir(ctx.prefix .. "/bin")
    ctx:write(ctx.prefix .. "/bin/helper", '#!/bin/sh\necho helper\n', true)
  end,
}

return {
  name = "greeter",
  version = "1",
  dependencies = { helper },
  input = { motd = motd },
  install = function(ctx)
    ctx:mkdir(ctx.prefix .. "/etc")
    ctx:install(ctx:input("motd"), ctx.prefix .. "/etc/motd")
    ctx:chdir(ctx.prefix, function(inner)
      inner:shell("echo hello > greeting")
    end)
  end,
}
"#,
  );

  let greeter = env.load("greeter");
  assert_eq!(greeter.dependencies.len(), 1);
  assert_eq!(greeter.dependencies[0].name, "helper");

  let order = env.install_from_source(&[greeter.clone()]).await;
  assert_eq!(order.len(), 2);

  let entry = env.store.lookup(greeter.id().unwrap()).unwrap();
  assert_eq!(std::fs::read_to_string(entry.join("etc/motd")).unwrap(), "welcome");
  assert_eq!(std::fs::read_to_string(entry.join("greeting")).unwrap(), "hello\n");

  let helper = env.store.lookup(greeter.dependencies[0].id().unwrap()).unwrap();
  assert!(helper.join("bin/helper").is_file());

  let info = env.store.read_info(greeter.id().unwrap()).unwrap();
  assert_eq!(info.inputs.len(), 1);
}
