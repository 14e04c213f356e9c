use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use kiln_lib::car::{CarError, CarInfo, CarSigner, pack};
use kiln_lib::install::{InstallError, install};
use kiln_lib::resolve::{ArchiveSource, DirArchiveSource, Installer};
use kiln_lib::store::PkgInfo;
use kiln_lib::util::hash::PackageId;

use super::common::{TestEnv, leaf_recipe};

const TOOL: &str = r#"
return {
  name = "tool",
  version = "1",
  dependencies = { kiln.dep("lib") },
  install = function(ctx)
    ctx:mkdir(ctx.prefix .. "/etc")
    ctx:write(ctx.prefix .. "/etc/lib-path", ctx:dep("lib") .. "/share/lib")
  end,
}
"#;

fn with_recipes() -> TestEnv {
  let env = TestEnv::new();
  env.write_recipe("lib", &leaf_recipe("lib", "library payload"));
  env.write_recipe("tool", TOOL);
  env
}

/// Builds `tool` in a fresh environment and publishes every entry to a cache directory.
async fn publish_all(cache: &DirArchiveSource) -> Vec<PackageId> {
  let builder = with_recipes();
  let tool = builder.load("tool");
  let order = builder.install_from_source(&[tool]).await;

  let signer = CarSigner::generate();
  for id in &order {
    let entry = builder.store.lookup(id).unwrap();
    let info = CarInfo::from_pkg_info(&PkgInfo::read(&entry).unwrap());
    let packed = pack(info, &entry, &signer, builder.store.active()).unwrap();
    cache.publish(&packed).unwrap();
  }
  order
}

#[tokio::test]
async fn substitutes_replace_builds() {
  let env = with_recipes();
  let cache = DirArchiveSource::new(env.temp.path().join("cache"));
  let order = publish_all(&cache).await;

  let tool = env.load("tool");
  let source: Arc<dyn ArchiveSource> = Arc::new(cache);
  let plan = env.plan(&[tool.clone()], Arc::clone(&source)).await;
  assert_eq!(plan.order, order);
  assert!(plan.iter().all(|p| matches!(p.installer, Installer::Archive(_))));

  let tool_plan = plan.get(tool.id().unwrap()).unwrap();
  assert_eq!(tool_plan.runtime_deps, vec![order[0].clone()]);

  let installed = install(&plan, &env.store, source.as_ref(), &env.options()).await.unwrap();
  assert_eq!(installed, order);

  let lib_entry = env.store.lookup(&order[0]).unwrap();
  assert_eq!(std::fs::read_to_string(lib_entry.join("share/lib")).unwrap(), "library payload");
  let info = env.store.read_info(tool.id().unwrap()).unwrap();
  assert_eq!(info.runtime_deps, vec![order[0].clone()]);
  assert!(env.store.sidecar_path(tool.id().unwrap()).exists());
}

#[tokio::test]
async fn tampered_archive_is_rejected_and_cleaned_up() {
  let env = with_recipes();
  let cache = DirArchiveSource::new(env.temp.path().join("cache"));
  let order = publish_all(&cache).await;
  let lib = &order[0];

  let path = cache.dir().join(format!("{lib}.car"));
  let mut tar = Vec::new();
  GzDecoder::new(std::fs::read(&path).unwrap().as_slice())
    .read_to_end(&mut tar)
    .unwrap();
  let at = tar
    .windows(b"library payload".len())
    .position(|w| w == b"library payload")
    .unwrap();
  tar[at] = b'L';
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(&tar).unwrap();
  std::fs::write(&path, encoder.finish().unwrap()).unwrap();

  let lib_recipe = env.load("lib");
  let source: Arc<dyn ArchiveSource> = Arc::new(cache);
  let plan = env.plan(&[lib_recipe], Arc::clone(&source)).await;
  let err = install(&plan, &env.store, source.as_ref(), &env.options())
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    InstallError::Archive {
      source: CarError::InvalidSignature,
      ..
    }
  ));
  assert_eq!(err.package(), Some(lib));
  assert!(!env.store.entry_path(lib).exists());
}
