//! Lua values to recipe [`Value`]s, and the userdata that carry recipes and
//! instances back into Lua.

use std::collections::BTreeMap;
use std::sync::Arc;

use mlua::prelude::*;

use crate::recipe::{Instance, Prototype, Recipe, Value};

use super::ctx::record_phase;

/// A loaded recipe as seen from Lua.
#[derive(Debug, Clone)]
pub struct RecipeRef(pub Arc<Recipe>);

/// An instance created by `kiln.fetch`, `kiln.file` or `kiln.build`.
#[derive(Debug, Clone)]
pub struct InstanceRef(pub Arc<Instance>);

impl LuaUserData for RecipeRef {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("name", |_, this| Ok(this.0.name.clone()));
    fields.add_field_method_get("version", |_, this| Ok(this.0.version.clone()));
    fields.add_field_method_get("id", |_, this| {
      this.0.id().map(|id| id.to_string()).map_err(LuaError::external)
    });
  }
}

impl LuaUserData for InstanceRef {
  fn add_fields<F: LuaUserDataFields<Self>>(fields: &mut F) {
    fields.add_field_method_get("name", |_, this| Ok(this.0.name.clone()));
    fields.add_field_method_get("version", |_, this| Ok(this.0.version.clone()));
    fields.add_field_method_get("id", |_, this| {
      this.0.id().map(|id| id.to_string()).map_err(LuaError::external)
    });
  }
}

/// Converts a Lua value. Functions are recorded as phases; empty tables read as nil.
pub fn to_value(lua: &Lua, value: LuaValue) -> LuaResult<Value> {
  match value {
    LuaValue::Nil => Ok(Value::Nil),
    LuaValue::Boolean(b) => Ok(Value::Bool(b)),
    LuaValue::Integer(i) => Ok(Value::Int(i)),
    LuaValue::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Ok(Value::Int(n as i64)),
    LuaValue::Number(n) => Ok(Value::Str(n.to_string())),
    LuaValue::String(s) => Ok(Value::Str(s.to_str()?.to_string())),
    LuaValue::Function(f) => Ok(Value::Phase(record_phase(lua, &f)?)),
    LuaValue::Table(table) => table_value(lua, table),
    LuaValue::UserData(ud) => {
      if let Ok(recipe) = ud.borrow::<RecipeRef>() {
        Ok(Value::Recipe(Arc::clone(&recipe.0)))
      } else if let Ok(instance) = ud.borrow::<InstanceRef>() {
        Ok(Value::Instance(Arc::clone(&instance.0)))
      } else {
        Err(LuaError::external("unsupported userdata in recipe definition"))
      }
    }
    other => Err(LuaError::external(format!(
      "unsupported {} in recipe definition",
      other.type_name()
    ))),
  }
}

fn table_value(lua: &Lua, table: LuaTable) -> LuaResult<Value> {
  let len = table.raw_len();
  if len > 0 {
    let items = table
      .sequence_values::<LuaValue>()
      .map(|v| to_value(lua, v?))
      .collect::<LuaResult<Vec<_>>>()?;
    return Ok(Value::List(items));
  }

  let mut map = BTreeMap::new();
  for pair in table.pairs::<LuaValue, LuaValue>() {
    let (key, value) = pair?;
    let key = match key {
      LuaValue::String(s) => s.to_str()?.to_string(),
      other => {
        return Err(LuaError::external(format!(
          "table keys must be strings, got {}",
          other.type_name()
        )));
      }
    };
    map.insert(key, to_value(lua, value)?);
  }
  if map.is_empty() {
    return Ok(Value::Nil);
  }
  Ok(Value::Map(map))
}

/// Reads a recipe definition table attribute by attribute.
pub fn to_prototype(lua: &Lua, table: LuaTable) -> LuaResult<Prototype> {
  let mut proto = Prototype::new();
  for pair in table.pairs::<String, LuaValue>() {
    let (name, value) = pair?;
    proto.set(name, to_value(lua, value)?);
  }
  Ok(proto)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::recipe::Attrs;

  fn eval(source: &str) -> LuaResult<Value> {
    let lua = Lua::new();
    let value: LuaValue = lua.load(source).eval()?;
    to_value(&lua, value)
  }

  #[test]
  fn scalars() -> LuaResult<()> {
    assert!(matches!(eval("return 3")?, Value::Int(3)));
    assert!(matches!(eval("return 2.0")?, Value::Int(2)));
    assert!(matches!(eval("return 'x'")?, Value::Str(ref s) if s == "x"));
    assert!(matches!(eval("return true")?, Value::Bool(true)));
    assert!(eval("return nil")?.is_nil());
    Ok(())
  }

  #[test]
  fn tables_become_lists_or_maps() -> LuaResult<()> {
    assert!(matches!(eval("return { 'a', 'b' }")?, Value::List(ref l) if l.len() == 2));
    assert!(matches!(eval("return { a = 1 }")?, Value::Map(ref m) if m.contains_key("a")));
    assert!(eval("return {}")?.is_nil());
    Ok(())
  }

  #[test]
  fn functions_are_recorded() -> LuaResult<()> {
    let value = eval("return function(ctx) ctx:mkdir(ctx.prefix) end")?;
    assert!(matches!(value, Value::Phase(ref p) if p.ops.len() == 1));
    Ok(())
  }

  #[test]
  fn recipes_pass_through_userdata() -> LuaResult<()> {
    let lua = Lua::new();
    let recipe = Arc::new(Recipe::builder("zlib", "1.3").build().map_err(LuaError::external)?);
    lua.globals().set("zlib", RecipeRef(Arc::clone(&recipe)))?;

    let name: String = lua.load("return zlib.name").eval()?;
    assert_eq!(name, "zlib");

    let value: LuaValue = lua.load("return { zlib }").eval()?;
    match to_value(&lua, value)? {
      Value::List(items) => assert!(matches!(&items[0], Value::Recipe(r) if Arc::ptr_eq(r, &recipe))),
      other => panic!("unexpected {other:?}"),
    }
    Ok(())
  }

  #[test]
  fn prototype_from_table() -> LuaResult<()> {
    let lua = Lua::new();
    let table: LuaTable = lua.load("return { name = 'hello', version = '2.12' }").eval()?;
    let proto = to_prototype(&lua, table)?;
    assert!(matches!(proto.attr("version"), Ok(Value::Str(ref v)) if v == "2.12"));
    Ok(())
  }

  #[test]
  fn non_string_map_keys_are_rejected() {
    assert!(eval("return { [true] = 1 }").is_err());
  }
}
