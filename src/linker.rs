//! Whole-program layout and placeholder resolution.
//!
//! The linked program is a list of assembly lines, one memory word each:
//!
//! ```text
//! word 0                  JMP code
//! words 1..=stack_size    the stack, growing upwards from SP = 0
//!                         globals
//!                         constants
//! code                    the program function, then every reachable function
//! ```
//!
//! Functions are placed depth-first in the order they are first called. Functions that are
//! never called are left out.

use slog::{debug, o, trace, Discard, Logger};

use std::fmt;

use crate::codegen::{Arg, Constant, GeneratedFunction, Module, Placeholder, Reg, SymbolicInstruction};
use crate::instruction::{Base, Condition, Instruction, Operand, Width};
use crate::symbol_table::{Storage, SymbolKey, SymbolTable};

/// Errors caused by inconsistent generated code. None of these can be caused by the source
/// program alone.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkError {
    /// A placeholder refers to a symbol with no address.
    Unresolved {
        function: SymbolKey,
        placeholder: String,
    },

    /// The stack depth at the end of a function differs from its depth at the start.
    StackImbalance {
        function: SymbolKey,
        depth: isize,
    },

    /// A resolved operand does not fit the 16-bit operand field.
    ImmediateOutOfRange {
        function: SymbolKey,
        value: i64,
    },

    /// A call refers to a function that was not generated.
    UnknownFunction {
        index: usize,
    },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::Unresolved { function, placeholder } =>
                write!(f, "unresolved placeholder {} in {}", placeholder, function),
            LinkError::StackImbalance { function, depth } =>
                write!(f, "stack depth of {} ends at {}", function, depth),
            LinkError::ImmediateOutOfRange { function, value } =>
                write!(f, "operand {} in {} does not fit in 16 bits", value, function),
            LinkError::UnknownFunction { index } =>
                write!(f, "call to unknown function #{}", index),
        }
    }
}

impl std::error::Error for LinkError {}

const OPERAND_RANGE: std::ops::RangeInclusive<i64> = -32768..=32767;

/// Word addresses of every region.
struct Layout {
    stack_size: u32,
    globals_words: u32,
    constants: Vec<u32>,
    code: u32,

    /// Entry address of each function, by index. `None` for functions left out.
    functions: Vec<Option<u32>>,
}

struct Linker<'m, 't, 'a> {
    module: &'m Module,
    table: &'t SymbolTable<'a>,
    layout: Layout,
}

/// Functions reachable from the program function, depth-first in order of first call.
fn placement(module: &Module) -> Result<Vec<usize>, LinkError> {
    let mut visited = vec![false; module.functions.len()];
    let mut order = Vec::new();
    let mut stack = vec![0];

    while let Some(index) = stack.pop() {
        match visited.get(index) {
            Some(true) => continue,
            Some(false) => (),
            None => return Err(LinkError::UnknownFunction { index }),
        }

        visited[index] = true;
        order.push(index);

        let function = module.functions.get(index).ok_or(LinkError::UnknownFunction { index })?;
        stack.extend(function.calls.iter().rev());
    }

    Ok(order)
}

/// Lays out `module` and resolves every placeholder.
///
/// # Errors
/// Returns a [LinkError] on the first inconsistency found. Linking never continues past one.
pub fn link<'a, L>(module: &Module, table: &SymbolTable<'a>, stack_size: u16, logger: L) -> Result<Vec<String>, LinkError>
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "link"));

    let order = placement(module)?;

    let stack_size = u32::from(stack_size);
    let globals_words = table.globals_words();

    let mut next = 1 + stack_size + globals_words;
    let mut constants = Vec::with_capacity(module.constants.len());

    for constant in &module.constants {
        constants.push(next);
        next += constant.words() as u32;
    }

    let code = next;
    let mut functions = vec![None; module.functions.len()];

    for &index in &order {
        functions[index] = Some(next);
        next += module.functions[index].body.len() as u32;
    }

    debug!(logger, "layout";
        "stack_size" => stack_size,
        "globals" => globals_words,
        "constants" => code - 1 - stack_size - globals_words,
        "code" => code,
        "words" => next);

    let linker = Linker {
        module,
        table,
        layout: Layout {
            stack_size,
            globals_words,
            constants,
            code,
            functions,
        },
    };

    let mut lines = Vec::with_capacity(next as usize);

    let program = SymbolKey::program();
    let entry = linker.check(&program, i64::from(linker.layout.code))?;
    lines.push(Instruction::<Operand, Width>::Jump { condition: Condition::Always, operand: Operand::immediate(entry) }.to_string());

    for _ in 0..linker.layout.stack_size + linker.layout.globals_words {
        lines.push(Instruction::<Operand, Width>::Data(0).to_string());
    }

    for constant in &module.constants {
        for word in pack(constant) {
            lines.push(Instruction::<Operand, Width>::Data(word).to_string());
        }
    }

    for &index in &order {
        let function = &module.functions[index];
        let start = lines.len();

        linker.function(function, &mut lines)?;

        if let Some(first) = lines.get_mut(start) {
            first.push_str(&format!(" # {}", function.key));
        }

        trace!(logger, "function placed"; "function" => %function.key, "address" => start, "words" => function.body.len());
    }

    debug!(logger, "program linked"; "lines" => lines.len(), "functions" => order.len());

    Ok(lines)
}

/// Words of a constant. Strings are packed four bytes a word, first byte most significant, and
/// terminated with a zero byte.
fn pack(constant: &Constant) -> Vec<i32> {
    match constant {
        Constant::Word(value) => vec![*value],
        Constant::Bytes(bytes) => {
            let mut padded = bytes.clone();
            padded.resize(constant.words() * 4, 0);

            padded.chunks(4)
                .map(|chunk| chunk.iter().fold(0u32, |word, byte| word << 8 | u32::from(*byte)) as i32)
                .collect()
        },
    }
}

impl<'m, 't, 'a> Linker<'m, 't, 'a> {
    fn check(&self, function: &SymbolKey, value: i64) -> Result<i32, LinkError> {
        if OPERAND_RANGE.contains(&value) {
            Ok(value as i32)
        } else {
            Err(LinkError::ImmediateOutOfRange { function: function.clone(), value })
        }
    }

    fn function(&self, function: &GeneratedFunction, lines: &mut Vec<String>) -> Result<(), LinkError> {
        let mut depth: isize = 0;

        for (index, instruction) in function.body.iter().enumerate() {
            let resolved = self.instruction(function, index, depth, instruction)?;

            depth += resolved.stack_effect();
            lines.push(resolved.to_string());
        }

        if depth != 0 {
            return Err(LinkError::StackImbalance { function: function.key.clone(), depth });
        }

        Ok(())
    }

    fn instruction(&self, function: &GeneratedFunction, index: usize, depth: isize, instruction: &SymbolicInstruction) -> Result<Instruction, LinkError> {
        instruction.clone().try_map(
            |arg| self.operand(function, index, depth, arg),
            |reg| self.register(function, reg),
        )
    }

    fn operand(&self, function: &GeneratedFunction, index: usize, depth: isize, arg: Arg) -> Result<Operand, LinkError> {
        let (base, offset, indirect) = match arg {
            Arg::Fixed(operand) => return Ok(operand),
            Arg::Exit => (Base::InstructionPointer, function.exit as i64 - index as i64 - 1, false),
            Arg::Symbol { placeholder, indirect } => {
                let (base, offset) = self.placeholder(function, depth as i64, &placeholder)?;
                (base, offset, indirect)
            },
        };

        let operand = Operand::relative(base, self.check(&function.key, offset)?);

        Ok(if indirect { operand.deref() } else { operand })
    }

    fn placeholder(&self, function: &GeneratedFunction, depth: i64, placeholder: &Placeholder) -> Result<(Base, i64), LinkError> {
        let unresolved = || LinkError::Unresolved {
            function: function.key.clone(),
            placeholder: placeholder.to_string(),
        };

        match placeholder {
            Placeholder::GlobalConstant(index) => {
                let address = i64::from(*self.layout.constants.get(*index).ok_or_else(unresolved)?);

                match self.module.constants.get(*index) {
                    Some(Constant::Word(_)) => Ok((Base::Immediate, address)),
                    Some(Constant::Bytes(_)) => Ok((Base::Immediate, address * 4)),
                    None => Err(unresolved()),
                }
            },
            Placeholder::Function(key) => {
                let index = self.table.function_index(key).ok_or_else(unresolved)?;

                match self.layout.functions.get(index) {
                    Some(Some(address)) => Ok((Base::Immediate, i64::from(*address))),
                    _ => Err(LinkError::UnknownFunction { index }),
                }
            },
            Placeholder::Address(key) => {
                let symbol = self.table.get_symbol(key).ok_or_else(unresolved)?;

                match symbol.storage {
                    Storage::Global { offset } if symbol.size > 0 => {
                        let bytes = i64::from((1 + self.layout.stack_size) * 4 + offset);
                        Ok((Base::Immediate, bytes / i64::from(symbol.size)))
                    },
                    Storage::Local { slot } => Ok((Base::StackPointer, -(depth - 1 - slot as i64))),
                    Storage::Parameter { index, count } => Ok((Base::StackPointer, -(depth + count as i64 - index as i64))),
                    _ => Err(unresolved()),
                }
            },
        }
    }

    fn register(&self, function: &GeneratedFunction, reg: Reg) -> Result<Width, LinkError> {
        let (key, element) = match reg {
            Reg::Fixed(width) => return Ok(width),
            Reg::Of(key) => (key, false),
            Reg::ElementOf(key) => (key, true),
        };

        let symbol = self.table.get_symbol(&key);

        let width = symbol.and_then(|symbol| match (element, symbol.is_global()) {
            (true, _) => Width::from_size(symbol.ty.element_size()),
            (false, true) => Width::from_size(symbol.size),
            (false, false) => Some(Width::Word),
        });

        width.ok_or_else(|| LinkError::Unresolved {
            function: function.key.clone(),
            placeholder: if element { format!("%e:{}%", key) } else { format!("%r:{}%", key) },
        })
    }
}
