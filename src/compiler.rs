//! Compilation from source text to assembly lines.
//!
//! Runs every stage of the pipeline in order: [lexing](crate::lexer), [parsing](crate::parser),
//! [symbol resolution](crate::symbol_table), [code generation](crate::codegen) and
//! [linking](crate::linker). Parse and generation errors are collected so that a single run
//! reports as many problems as possible.

use slog::{debug, info, o, Discard, Logger};

use std::fmt;

use crate::codegen::{self, GenerateError};
use crate::lexer::{self, LexError};
use crate::linker::{self, LinkError};
use crate::parser::{self, ParseError};
use crate::symbol_table;

#[derive(Clone, Debug, PartialEq)]
pub struct CompilerConfig {
    /// Number of words reserved for the stack.
    pub stack_size: u16,
}

impl Default for CompilerConfig {
    fn default() -> CompilerConfig {
        CompilerConfig {
            stack_size: 512,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    Lex(LexError),
    Parse(Vec<ParseError>),
    Generate(Vec<GenerateError>),
    Link(LinkError),
}

impl CompileError {
    /// Number of individual errors carried.
    pub fn count(&self) -> usize {
        match self {
            CompileError::Parse(errors) => errors.len(),
            CompileError::Generate(errors) => errors.len(),
            _ => 1,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompileError::Lex(err) => write!(f, "{}", err),
            CompileError::Parse(errors) => write_all(f, errors),
            CompileError::Generate(errors) => write_all(f, errors),
            CompileError::Link(err) => write!(f, "internal error: {}", err),
        }
    }
}

fn write_all<E: fmt::Display>(f: &mut fmt::Formatter, errors: &[E]) -> fmt::Result {
    for (i, err) in errors.iter().enumerate() {
        if i > 0 {
            writeln!(f)?;
        }

        write!(f, "{}", err)?;
    }

    Ok(())
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(err: LexError) -> CompileError {
        CompileError::Lex(err)
    }
}

impl From<LinkError> for CompileError {
    fn from(err: LinkError) -> CompileError {
        CompileError::Link(err)
    }
}

/// Compiles `source` with the default configuration.
pub fn compile(source: &str) -> Result<Vec<String>, CompileError> {
    compile_with_config(source, &CompilerConfig::default(), None)
}

/// Compiles `source` into assembly lines, one memory word per line.
///
/// # Errors
/// Stops at the first stage that fails. Lexing and linking stop at their first error, parsing
/// and generation report all of theirs.
pub fn compile_with_config<L>(source: &str, config: &CompilerConfig, logger: L) -> Result<Vec<String>, CompileError>
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()));

    let tokens = lexer::tokenize(source, logger.clone())?;
    let program = parser::parse(tokens, logger.clone()).map_err(CompileError::Parse)?;

    let (table, mut errors) = symbol_table::resolve(&program, logger.clone());

    match codegen::generate(&table, logger.clone()) {
        Ok(_) if !errors.is_empty() => return Err(CompileError::Generate(errors)),
        Ok(module) => {
            let lines = linker::link(&module, &table, config.stack_size, logger.clone())?;

            info!(logger, "compiled";
                "source_bytes" => source.len(),
                "words" => lines.len(),
                "functions" => module.functions.len());

            Ok(lines)
        },
        Err(generate_errors) => {
            errors.extend(generate_errors);
            debug!(logger, "generation failed"; "errors" => errors.len());

            Err(CompileError::Generate(errors))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiles_to_plain_assembly() {
        let lines = compile("int32 a = 2\nint32 b = 3\nOUT(a + b)").unwrap();

        assert_eq!(lines[0], "JMP 515");
        assert!(lines.iter().all(|line| !line.contains('%')));
        assert_eq!(lines.last().map(String::as_str), Some("HALT"));
    }

    #[test]
    fn test_stack_size_is_configurable() {
        let config = CompilerConfig { stack_size: 8 };
        let lines = compile_with_config("OUT(1)", &config, None).unwrap();

        assert_eq!(lines[0], "JMP 9");
        assert_eq!(lines.len(), 9 + 4);
    }

    #[test]
    fn test_stage_errors() {
        assert!(match compile("str s = \"open") {
            Err(CompileError::Lex(LexError::UnterminatedString { position: 8 })) => true,
            _ => false,
        });

        assert!(match compile("int32 a = ;\nb = 1 +\nint32 c = 3") {
            Err(CompileError::Parse(errors)) => errors.len() == 2,
            _ => false,
        });
    }

    #[test]
    fn test_resolve_and_generate_errors_are_reported_together() {
        let err = compile("void v = 1\nOUT(w)").unwrap_err();

        assert_eq!(err.count(), 2);
        assert!(match &err {
            CompileError::Generate(errors) => match (&errors[0], &errors[1]) {
                (GenerateError::VoidVariable { .. }, GenerateError::Undeclared { .. }) => true,
                _ => false,
            },
            _ => false,
        });

        assert!(err.to_string().contains("undeclared variable 'w'"));
    }
}
