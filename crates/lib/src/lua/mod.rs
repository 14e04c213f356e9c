//! Lua recipe files.
//!
//! A recipe file returns a table using the recipe attribute names (`name`,
//! `version`, `dependencies`, `install`, ...). Phase attributes are functions;
//! each is called once with a recording `ctx` and becomes a [`crate::action::Phase`].
//!
//! - [`runtime`] - the [`LuaLoader`] and Lua state setup
//! - [`globals`] - the `kiln` global table
//! - [`ctx`] - the phase recording context
//! - [`convert`] - Lua values to recipe values

pub mod convert;
pub mod ctx;
pub mod globals;
pub mod runtime;

pub use runtime::LuaLoader;
