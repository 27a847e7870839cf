// File: src/driver.rs
//
// Wires lexer -> parser -> compiler -> VM into the single entry point the
// CLI (and embedders) call (spec §6, component C7). Also renders a
// failure with a caret-underlined source excerpt, matching spec §7's error
// contract.

use crate::bytecode::Chunk;
use crate::errors::PyleError;
use crate::value::Value;
use crate::vm::{Vm, VmConfig};

pub struct RunOutcome {
    pub result: Value,
}

/// Compiles source text all the way to a `Chunk` without running it —
/// used by the `-d/--disassemble` CLI flag.
pub fn compile_source(source: &str, file: &str) -> Result<Chunk, PyleError> {
    let span = tracing::info_span!("compile", file);
    let _enter = span.enter();
    let tokens = crate::lexer::tokenize(source, file)?;
    let stmts = crate::parser::parse(tokens, file)?;
    crate::compiler::compile(&stmts)
}

/// Compiles and runs `source`, returning the program's final value
/// (whatever the top-level `return`, or the trailing `Halt`, produces).
pub fn run_source(source: &str, file: &str, config: VmConfig) -> Result<RunOutcome, PyleError> {
    let chunk = compile_source(source, file)?;
    tracing::debug!(file, instructions = chunk.code.len(), "compiled");
    let mut vm = Vm::with_config(chunk, config);
    let result = vm.run()?;
    Ok(RunOutcome { result })
}

/// Renders a `PyleError` the way the CLI prints failures: the error line,
/// then the offending source line with a caret under the column.
pub fn render_error(err: &PyleError, source: &str) -> String {
    let line_text = source.lines().nth(err.location().line.saturating_sub(1));
    err.render_with_source(line_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_simple_arithmetic_program() {
        let outcome = run_source("return 2 + 2", "t.pyle", VmConfig::default()).unwrap();
        assert!(matches!(outcome.result, Value::Int(4)));
    }

    #[test]
    fn reports_syntax_errors_with_location() {
        let err = compile_source("let = 1", "t.pyle").unwrap_err();
        assert!(matches!(err, PyleError::Syntactic { .. }));
    }

    #[test]
    fn render_error_includes_caret_line() {
        let src = "let x = 1 / 0\nreturn x";
        let err = run_source(src, "t.pyle", VmConfig::default()).unwrap_err();
        let rendered = render_error(&err, src);
        assert!(rendered.contains('^'));
    }
}
