//! A crate for compiling and running programs written in a small C-like language on an
//! imaginary 32-bit accumulator machine.
//!
//! Currently this crate provides the functionality to:
//! - Compile source programs into the machine's assembly, one memory word per line.
//! - Assemble and load those lines into memory.
//! - Execute the loaded program signal by signal, counting the clock ticks spent.
//!
//! # Pipeline
//!
//! Source text goes through the [lexer], the [parser], the [symbol_table] resolver, the
//! [codegen] stage and the [linker]. The [compiler] module runs all of them in order.
//! The resulting lines are read back by the [assembler] and executed by the [control] unit,
//! which drives the [datapath] and its [memory].
//!
//! # Example
//! ```
//! use acc32::{
//!     assembler,
//!     compiler,
//!     control::{self, SimulationConfig, StopReason},
//!     datapath::TestIo,
//! };
//!
//! // Adds two globals together and outputs the low byte of the sum.
//! let source = "int32 a = 40\nint32 b = 2\nOUT(a + b)";
//!
//! // Compile the source into assembly lines.
//! let lines = compiler::compile(source).unwrap();
//!
//! // Assemble the lines into memory.
//! let memory = assembler::load(&lines[..], None).unwrap();
//!
//! // Run the program with no input.
//! let report = control::simulate(memory, TestIo::new(), &SimulationConfig::default(), None)
//!     .unwrap();
//!
//! assert_eq!(report.output, vec![42]);
//! assert_eq!(report.stop, StopReason::Halted);
//! ```
//!
//! # Executables
//!
//! ## `acc32c`
//!
//! Compiles a source file into an assembly file.
//!
//! ```text
//! $ acc32c sum.c sum.asm --stack-size 64
//! ```
//!
//! ## `acc32run`
//!
//! Runs an assembly file, optionally feeding it the bytes of an input file, and reports the
//! output together with the instruction and tick counts.
//!
//! ```text
//! $ acc32run sum.asm
//! ```
pub mod ast;
pub mod lexer;
pub mod parsing;
pub mod parser;
pub mod symbol_table;
pub mod codegen;
pub mod linker;
pub mod compiler;
pub mod error;
pub mod instruction;
pub mod assembler;
pub mod memory;
pub mod datapath;
pub mod event;
pub mod control;

pub use compiler::{compile, CompileError, CompilerConfig};
pub use control::{simulate, SimulationConfig, SimulationReport, StopReason};
