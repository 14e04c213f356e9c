mod common;

mod archive_tests;
mod install_tests;
mod lua_tests;
mod signature_tests;
