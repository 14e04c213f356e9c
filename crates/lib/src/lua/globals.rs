//! The `kiln` global table.
//!
//! - `kiln.os`, `kiln.arch`, `kiln.platform` describe the host
//! - `kiln.dir` is the directory of the file being evaluated
//! - `kiln.dep(name [, args])` loads another recipe from the repository
//! - `kiln.fetch{}`, `kiln.file{}` and `kiln.build{}` create instances

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use mlua::prelude::*;

use crate::action::Checksum;
use crate::execute::actions::fetch::url_to_filename;
use crate::platform::HostPlatform;
use crate::recipe::{Instance, InstanceKind, Recipe, Value};

use super::convert::{InstanceRef, RecipeRef, to_value};
use super::ctx::record_phase;
use super::runtime::LuaLoader;

fn required(spec: &LuaTable, func: &str, field: &str) -> LuaResult<String> {
  spec
    .get::<Option<String>>(field)?
    .ok_or_else(|| LuaError::external(format!("kiln.{func} requires '{field}'")))
}

fn fetch_instance(spec: LuaTable) -> LuaResult<InstanceRef> {
  let url = required(&spec, "fetch", "url")?;
  let checksum: Checksum = required(&spec, "fetch", "checksum")?
    .parse()
    .map_err(LuaError::external)?;
  let filename = spec
    .get::<Option<String>>("filename")?
    .unwrap_or_else(|| url_to_filename(&url));
  let name = spec.get::<Option<String>>("name")?.unwrap_or_else(|| filename.clone());
  let version = spec.get::<Option<String>>("version")?;

  let kind = InstanceKind::Fetch { url, checksum, filename };
  Ok(InstanceRef(Arc::new(Instance::new(name, version, kind))))
}

fn file_instance(spec: LuaTable) -> LuaResult<InstanceRef> {
  let name = required(&spec, "file", "name")?;
  let contents = required(&spec, "file", "contents")?;
  let executable = spec.get::<Option<bool>>("executable")?.unwrap_or(false);
  let version = spec.get::<Option<String>>("version")?;

  let kind = InstanceKind::File { contents, executable };
  Ok(InstanceRef(Arc::new(Instance::new(name, version, kind))))
}

fn build_instance(lua: &Lua, loader: &LuaLoader, spec: LuaTable) -> LuaResult<InstanceRef> {
  let name = required(&spec, "build", "name")?;
  let version = spec.get::<Option<String>>("version")?;
  let phase = match spec.get::<Option<LuaFunction>>("phase")? {
    Some(func) => record_phase(lua, &func)?,
    None => return Err(LuaError::external("kiln.build requires a 'phase' function")),
  };

  let dependencies = match to_value(lua, spec.get::<LuaValue>("dependencies")?)? {
    Value::Nil => Vec::new(),
    Value::List(items) => items
      .into_iter()
      .map(|item| match item {
        Value::Recipe(recipe) => Ok(recipe),
        Value::Instance(instance) => Recipe::from_instance(&instance, loader.namespace(), loader.constraints())
          .map(Arc::new)
          .map_err(LuaError::external),
        other => Err(LuaError::external(format!(
          "kiln.build dependencies must be recipes or instances, got {}",
          other.type_name()
        ))),
      })
      .collect::<LuaResult<Vec<_>>>()?,
    other => {
      return Err(LuaError::external(format!(
        "kiln.build dependencies must be a list, got {}",
        other.type_name()
      )));
    }
  };

  let kind = InstanceKind::Build { phase, dependencies };
  Ok(InstanceRef(Arc::new(Instance::new(name, version, kind))))
}

/// Registers the `kiln` global for a file living in `dir`.
pub fn register_globals(lua: &Lua, loader: &LuaLoader, dir: &Path) -> LuaResult<()> {
  let kiln = lua.create_table()?;

  let host = HostPlatform::detect();
  kiln.set("platform", format!("{}-{}", host.arch, host.os))?;
  kiln.set("os", host.os)?;
  kiln.set("arch", host.arch)?;
  kiln.set("dir", dir.to_string_lossy().to_string())?;

  let deps = loader.clone();
  let dep = lua.create_function(move |_, (name, args): (String, Option<BTreeMap<String, String>>)| {
    deps
      .load_with_args(&name, args.unwrap_or_default())
      .map(RecipeRef)
      .map_err(LuaError::external)
  })?;
  kiln.set("dep", dep)?;

  kiln.set("fetch", lua.create_function(|_, spec: LuaTable| fetch_instance(spec))?)?;
  kiln.set("file", lua.create_function(|_, spec: LuaTable| file_instance(spec))?)?;

  let builds = loader.clone();
  let build = lua.create_function(move |lua, spec: LuaTable| build_instance(lua, &builds, spec))?;
  kiln.set("build", build)?;

  lua.globals().set("kiln", kiln)?;
  Ok(())
}
