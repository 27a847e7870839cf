// File: src/lib.rs
//
// Pyle: a small dynamically-typed scripting language with a single-pass
// bytecode compiler and a stack-based VM.

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod driver;
pub mod errors;
pub mod lexer;
pub mod module;
pub mod native;
pub mod parser;
pub mod value;
pub mod vm;

/// Compiles `source` to a `Chunk` without running it (spec §6's embedding
/// API) — a thin re-export of `driver::compile_source` at the crate root so
/// an embedder depends only on `pyle`, not on the driver module layout.
pub fn compile(source: &str, file_name: &str) -> Result<bytecode::Chunk, errors::PyleError> {
    driver::compile_source(source, file_name)
}
