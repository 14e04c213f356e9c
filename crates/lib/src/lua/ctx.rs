//! The `ctx` object handed to recipe phase functions.
//!
//! Phase functions run once, at load time. Every method call appends an operation
//! to the phase being recorded; nothing touches the filesystem here. The
//! directory fields are placeholders resolved when the phase is executed.

use std::collections::BTreeMap;

use mlua::prelude::*;

use crate::action::{self, Checksum, Phase, PhaseBuilder};

#[derive(Debug, Default)]
pub struct PhaseCtx {
  builder: PhaseBuilder,
}

fn string_list(value: Option<LuaTable>) -> LuaResult<Vec<String>> {
  match value {
    Some(table) => table.sequence_values::<String>().collect(),
    None => Ok(Vec::new()),
  }
}

fn string_map(value: Option<LuaTable>) -> LuaResult<BTreeMap<String, String>> {
  match value {
    Some(table) => table.pairs::<String, String>().collect(),
    None => Ok(BTreeMap::new()),
  }
}

impl LuaUserData for PhaseCtx {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("prefix", |_, _| Ok(action::PREFIX));
    fields.add_field_method_get("build", |_, _| Ok(action::BUILD));
    fields.add_field_method_get("top", |_, _| Ok(action::TOP));
  }

  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_method("dep", |_, _, name: String| Ok(action::dep(&name)));
    methods.add_method("input", |_, _, name: String| Ok(action::input(&name)));

    methods.add_method_mut(
      "exec",
      |_, this, (program, args, env): (String, Option<LuaTable>, Option<LuaTable>)| {
        this
          .builder
          .exec_with_env(program, string_list(args)?, string_map(env)?);
        Ok(())
      },
    );
    methods.add_method_mut("shell", |_, this, script: String| {
      this.builder.shell(script);
      Ok(())
    });
    methods.add_method_mut("patch", |_, this, (file, strip): (String, Option<u32>)| {
      this.builder.patch(file, strip.unwrap_or(1));
      Ok(())
    });
    methods.add_method_mut("replace", |_, this, (file, from, to): (String, String, String)| {
      this.builder.replace(file, from, to);
      Ok(())
    });
    methods.add_method_mut("setenv", |_, this, (key, value): (String, String)| {
      this.builder.set_env(key, value);
      Ok(())
    });
    methods.add_method_mut("append_env", |_, this, (key, value): (String, String)| {
      this.builder.append_env(key, value);
      Ok(())
    });
    methods.add_method_mut("prepend_env", |_, this, (key, value): (String, String)| {
      this.builder.prepend_env(key, value);
      Ok(())
    });
    methods.add_method_mut("symlink", |_, this, (target, link): (String, String)| {
      this.builder.symlink(target, link);
      Ok(())
    });
    methods.add_method_mut("install", |_, this, (src, dest, link): (String, String, Option<bool>)| {
      if link.unwrap_or(false) {
        this.builder.install_link(src, dest);
      } else {
        this.builder.install(src, dest);
      }
      Ok(())
    });
    methods.add_method_mut("mkdir", |_, this, path: String| {
      this.builder.mkdir(path);
      Ok(())
    });
    methods.add_method_mut(
      "write",
      |_, this, (path, contents, executable): (String, String, Option<bool>)| {
        if executable.unwrap_or(false) {
          this.builder.write_executable(path, contents);
        } else {
          this.builder.write(path, contents);
        }
        Ok(())
      },
    );
    methods.add_method_mut("download", |_, this, (url, dest, checksum): (String, String, String)| {
      let checksum: Checksum = checksum.parse().map_err(LuaError::external)?;
      this.builder.download(url, dest, checksum);
      Ok(())
    });
    methods.add_method_mut("unpack", |_, this, (archive, dest, strip): (String, String, Option<u32>)| {
      this.builder.unpack(archive, dest, strip.unwrap_or(0));
      Ok(())
    });

    // The body receives this same ctx, so no borrow may be held while it runs.
    methods.add_function("chdir", |_, (ud, dir, body): (LuaAnyUserData, String, LuaFunction)| {
      ud.borrow_mut::<PhaseCtx>()?.builder.begin_chdir(dir);
      let result = body.call::<()>(ud.clone());
      ud.borrow_mut::<PhaseCtx>()?.builder.end_chdir();
      result
    });
  }
}

/// Calls `func` with a fresh recording context and returns what it recorded.
pub fn record_phase(lua: &Lua, func: &LuaFunction) -> LuaResult<Phase> {
  let ud = lua.create_userdata(PhaseCtx::default())?;
  func.call::<()>(ud.clone())?;
  Ok(ud.take::<PhaseCtx>()?.builder.finish())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::Op;

  fn record(source: &str) -> LuaResult<Phase> {
    let lua = Lua::new();
    let func: LuaFunction = lua.load(source).eval()?;
    record_phase(&lua, &func)
  }

  #[test]
  fn records_operations_in_order() -> LuaResult<()> {
    let phase = record(
      r#"
      return function(ctx)
        ctx:mkdir(ctx.prefix .. "/bin")
        ctx:exec("make", { "install", "PREFIX=" .. ctx.prefix }, { CC = "cc" })
        ctx:write(ctx.prefix .. "/bin/hi", '#!/bin/sh\necho hi\n', true)
        ctx:setenv("LANG", "C")
      end
    "#,
    )?;

    assert_eq!(phase.ops.len(), 4);
    assert_eq!(
      phase.ops[0],
      Op::Mkdir {
        path: format!("{}/bin", action::PREFIX)
      }
    );
    match &phase.ops[1] {
      Op::Exec { program, args, env } => {
        assert_eq!(program, "make");
        assert_eq!(args[1], format!("PREFIX={}", action::PREFIX));
        assert_eq!(env.get("CC").map(String::as_str), Some("cc"));
      }
      other => panic!("unexpected op {other:?}"),
    }
    assert!(matches!(phase.ops[2], Op::WriteFile { executable: true, .. }));
    Ok(())
  }

  #[test]
  fn chdir_nests_its_body() -> LuaResult<()> {
    let phase = record(
      r#"
      return function(ctx)
        ctx:chdir("src", function(inner)
          inner:shell("./configure")
        end)
        ctx:shell("true")
      end
    "#,
    )?;

    assert_eq!(phase.ops.len(), 2);
    match &phase.ops[0] {
      Op::Chdir { dir, body } => {
        assert_eq!(dir, "src");
        assert_eq!(body.len(), 1);
      }
      other => panic!("unexpected op {other:?}"),
    }
    Ok(())
  }

  #[test]
  fn placeholders_for_deps_and_inputs() -> LuaResult<()> {
    let phase = record(
      r#"
      return function(ctx)
        ctx:install(ctx:input("src"), ctx:dep("zlib") .. "/lib")
      end
    "#,
    )?;
    assert_eq!(
      phase.ops[0],
      Op::Install {
        src: action::input("src"),
        dest: format!("{}/lib", action::dep("zlib")),
        link: false,
      }
    );
    Ok(())
  }

  #[test]
  fn bad_checksum_is_an_error() {
    let result = record(
      r#"
      return function(ctx)
        ctx:download("https://example.com/a.tar.gz", "a.tar.gz", "md5:abc")
      end
    "#,
    );
    assert!(result.is_err());
  }
}
