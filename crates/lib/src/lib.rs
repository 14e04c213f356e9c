//! kiln-lib: a content-addressed package manager.
//!
//! - [`recipe`] and [`lua`]: package definitions and the Lua files they are loaded from
//! - [`signature`]: package identity computed by running phases in hash mode
//! - [`execute`] and [`build`]: running phases for real into a store entry
//! - [`resolve`] and [`install`]: planning and carrying out an install
//! - [`car`]: signed, reproducible package archives
//! - [`store`] and [`gc`]: the on-disk store and its garbage collector

pub mod action;
pub mod build;
pub mod car;
pub mod config;
pub mod consts;
pub mod execute;
pub mod gc;
pub mod install;
pub mod lua;
pub mod placeholder;
pub mod platform;
pub mod recipe;
pub mod resolve;
pub mod signature;
pub mod store;
pub mod util;
