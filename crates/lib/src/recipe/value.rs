//! Attribute values exchanged with the recipe scripting layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::action::Phase;
use crate::execute::ExecContext;

use super::{Instance, Recipe, RecipeError};

/// A value produced by a recipe definition.
///
/// This is the closed set of shapes the scripting layer can hand back; anything
/// else is rejected at the boundary.
#[derive(Debug, Clone, Default)]
pub enum Value {
  #[default]
  Nil,
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<Value>),
  Map(BTreeMap<String, Value>),
  Phase(Phase),
  Recipe(Arc<Recipe>),
  Instance(Arc<Instance>),
}

impl Value {
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Nil => "nil",
      Value::Bool(_) => "bool",
      Value::Int(_) => "int",
      Value::Str(_) => "string",
      Value::List(_) => "list",
      Value::Map(_) => "map",
      Value::Phase(_) => "phase",
      Value::Recipe(_) => "recipe",
      Value::Instance(_) => "instance",
    }
  }

  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  /// Scalar values rendered as text; `None` for everything else.
  pub fn as_text(&self) -> Option<String> {
    match self {
      Value::Str(s) => Some(s.clone()),
      Value::Int(i) => Some(i.to_string()),
      Value::Bool(b) => Some(b.to_string()),
      _ => None,
    }
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::Str(value.to_string())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Value::Str(value)
  }
}

impl From<Phase> for Value {
  fn from(value: Phase) -> Self {
    Value::Phase(value)
  }
}

impl From<Arc<Recipe>> for Value {
  fn from(value: Arc<Recipe>) -> Self {
    Value::Recipe(value)
  }
}

impl From<Arc<Instance>> for Value {
  fn from(value: Arc<Instance>) -> Self {
    Value::Instance(value)
  }
}

/// Named attribute access.
///
/// Implemented by the three kinds of object a recipe can see: a recipe
/// [`Prototype`], an [`Instance`] and the run context handed to phases.
pub trait Attrs {
  fn attr(&self, name: &str) -> Result<Value, RecipeError>;
}

/// A recipe definition as produced by the scripting layer, before validation.
#[derive(Debug, Clone, Default)]
pub struct Prototype {
  attrs: BTreeMap<String, Value>,
}

impl Prototype {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.attrs.insert(name.into(), value.into());
    self
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.attrs.insert(name.into(), value.into());
  }
}

impl Attrs for Prototype {
  /// Unset attributes read as [`Value::Nil`].
  fn attr(&self, name: &str) -> Result<Value, RecipeError> {
    Ok(self.attrs.get(name).cloned().unwrap_or_default())
  }
}

impl Attrs for Instance {
  fn attr(&self, name: &str) -> Result<Value, RecipeError> {
    match name {
      "name" => Ok(Value::Str(self.name.clone())),
      "version" => Ok(Value::Str(self.version.clone())),
      "id" => Ok(Value::Str(self.id()?.to_string())),
      _ => Err(RecipeError::UnknownAttr {
        object: format!("instance {}", self.name),
        attr: name.to_string(),
      }),
    }
  }
}

impl Attrs for ExecContext {
  fn attr(&self, name: &str) -> Result<Value, RecipeError> {
    match name {
      "prefix" => Ok(Value::Str(self.prefix.clone())),
      "build" => Ok(Value::Str(self.build.clone())),
      "top" => Ok(Value::Str(self.top.clone())),
      "cwd" => Ok(Value::Str(self.cwd.display().to_string())),
      "env" => Ok(Value::Map(
        self
          .env
          .iter()
          .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
          .collect(),
      )),
      _ => Err(RecipeError::UnknownAttr {
        object: "run context".to_string(),
        attr: name.to_string(),
      }),
    }
  }
}
