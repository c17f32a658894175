// Islet: Embedded ISO ISLISP Runtime
// This module only exports the Islet runtime modules.
extern crate num_bigint;
extern crate num_traits;

pub mod arena;
pub mod arrays;
pub mod builtins;
pub mod classes;
pub mod conditions;
pub mod control;
pub mod env;
pub mod eval;
pub mod machine;
pub mod printer;
pub mod reader;
pub mod streams;
pub mod symbol;
pub mod types;
