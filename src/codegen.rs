//! Lowering of the AST to symbolic instructions.
//!
//! Every function is generated separately into a list of [Instruction]s whose operands may still
//! refer to symbols. Addresses of variables depend on the stack depth at each instruction and the
//! final memory layout, so they are left as [Placeholder]s for the [linker](crate::linker).
//!
//! The generated code evaluates formulas on the stack: every formula pushes exactly one word and
//! every statement leaves the stack as it found it.

use edit_distance::edit_distance;
use slog::{debug, o, trace, Discard, Logger};

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::ast::{BinaryOperator, Branching, Formula, FormulaKind, Node, NodeKind, Position, Type, RETURN_SLOT};
use crate::instruction::{AluOp, Base, Condition, Instruction, Interrupt, Operand, UnaryOp, Width};
use crate::symbol_table::{Category, SymbolKey, SymbolTable};

#[derive(Clone, Debug, PartialEq)]
pub enum GenerateError {
    /// A variable is used before or without a declaration.
    Undeclared {
        name: String,
        position: Position,
        suggestion: Option<String>,
    },

    /// No function or built-in with this name and arity is visible.
    UndeclaredFunction {
        name: String,
        arity: usize,
        position: Position,
        suggestion: Option<String>,
    },

    /// A function with this name is visible but takes a different number of arguments.
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        position: Position,
    },

    /// A variable or parameter is declared `void`.
    VoidVariable {
        name: String,
        position: Position,
    },

    /// A procedure without a result is used as a value.
    VoidInExpression {
        name: String,
        position: Position,
    },

    NonPositiveArraySize {
        name: String,
        size: i32,
        position: Position,
    },

    /// `return` with a value inside a `void` function.
    UnexpectedReturnValue {
        position: Position,
    },
}

impl fmt::Display for GenerateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use GenerateError::*;

        match self {
            Undeclared { name, position, suggestion } => {
                write!(f, "{}: undeclared variable '{}'", position, name)?;

                if let Some(suggestion) = suggestion {
                    write!(f, ", did you mean '{}'?", suggestion)?;
                }

                Ok(())
            },
            UndeclaredFunction { name, arity, position, suggestion } => {
                write!(f, "{}: undeclared function '{}' taking {} arguments", position, name, arity)?;

                if let Some(suggestion) = suggestion {
                    write!(f, ", did you mean '{}'?", suggestion)?;
                }

                Ok(())
            },
            ArityMismatch { name, expected, found, position } =>
                write!(f, "{}: '{}' takes {} arguments but {} were given", position, name, expected, found),
            VoidVariable { name, position } =>
                write!(f, "{}: variable '{}' cannot be void", position, name),
            VoidInExpression { name, position } =>
                write!(f, "{}: '{}' does not return a value", position, name),
            NonPositiveArraySize { name, size, position } =>
                write!(f, "{}: array '{}' has non-positive size {}", position, name, size),
            UnexpectedReturnValue { position } =>
                write!(f, "{}: cannot return a value from a void function", position),
        }
    }
}

impl std::error::Error for GenerateError {}

/// A value known only once the program is laid out.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Placeholder {
    /// Index into [Module::constants]. Numbers resolve to their word address, strings to the byte
    /// address of their first character.
    GlobalConstant(usize),

    /// Entry address of a function.
    Function(SymbolKey),

    /// Address of a variable, in units of its own storage width.
    Address(SymbolKey),
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Placeholder::GlobalConstant(index) => write!(f, "%c:{}%", index),
            Placeholder::Function(key) | Placeholder::Address(key) => write!(f, "%{}%", key),
        }
    }
}

/// Operand of a symbolic instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Fixed(Operand),
    Symbol {
        placeholder: Placeholder,
        indirect: bool,
    },

    /// `IP`-relative target of the function epilogue.
    Exit,
}

impl Arg {
    fn address(key: SymbolKey) -> Arg {
        Arg::Symbol { placeholder: Placeholder::Address(key), indirect: false }
    }

    fn memory(key: SymbolKey) -> Arg {
        Arg::Symbol { placeholder: Placeholder::Address(key), indirect: true }
    }

    fn immediate(value: i32) -> Arg {
        Arg::Fixed(Operand::immediate(value))
    }

    fn stack(offset: i32) -> Arg {
        Arg::Fixed(Operand::relative(Base::StackPointer, offset))
    }

    fn ip(offset: usize) -> Arg {
        Arg::Fixed(Operand::relative(Base::InstructionPointer, offset as i32))
    }

    fn ip_back(offset: usize) -> Arg {
        Arg::Fixed(Operand::relative(Base::InstructionPointer, -(offset as i32)))
    }

    fn accumulator() -> Arg {
        Arg::Fixed(Operand::relative(Base::Accumulator, 0))
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arg::Fixed(operand) => write!(f, "{}", operand),
            Arg::Symbol { placeholder, indirect: true } => write!(f, "[{}]", placeholder),
            Arg::Symbol { placeholder, indirect: false } => write!(f, "{}", placeholder),
            Arg::Exit => write!(f, "%exit%"),
        }
    }
}

/// Register of a symbolic instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Reg {
    Fixed(Width),

    /// Width of the storage cell of a variable.
    Of(SymbolKey),

    /// Width of one element when the variable is indexed.
    ElementOf(SymbolKey),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Reg::Fixed(width) => write!(f, "{}", width),
            Reg::Of(key) => write!(f, "%r:{}%", key),
            Reg::ElementOf(key) => write!(f, "%e:{}%", key),
        }
    }
}

pub type SymbolicInstruction = Instruction<Arg, Reg>;

const EAX: Reg = Reg::Fixed(Width::Word);

/// Data placed in the constants region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Constant {
    /// A number too large for the 16-bit operand field.
    Word(i32),

    /// Bytes of a string literal, stored without the terminating zero.
    Bytes(Vec<u8>),
}

impl Constant {
    /// Number of memory words the constant occupies.
    pub fn words(&self) -> usize {
        match self {
            Constant::Word(_) => 1,
            Constant::Bytes(bytes) => (bytes.len() + 1 + 3) / 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeneratedFunction {
    pub key: SymbolKey,

    /// Index of the function in the symbol table.
    pub index: usize,
    pub body: Vec<SymbolicInstruction>,

    /// Index of the first epilogue instruction in `body`.
    pub exit: usize,

    /// Functions called from the body, in order of their first call.
    pub calls: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct Module {
    /// Generated functions, indexed like [SymbolTable::functions].
    pub functions: Vec<GeneratedFunction>,
    pub constants: Vec<Constant>,
}

/// Procedures implemented directly by instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Builtin {
    Out,
    In,
    Halt,
}

impl Builtin {
    const ALL: [(&'static str, usize, Builtin); 3] = [
        ("OUT", 1, Builtin::Out),
        ("IN", 0, Builtin::In),
        ("HALT", 0, Builtin::Halt),
    ];

    fn find(name: &str, arity: usize) -> Option<Builtin> {
        Builtin::ALL.iter()
            .find(|(n, a, _)| *n == name && *a == arity)
            .map(|(_, _, builtin)| *builtin)
    }
}

#[derive(Clone, Copy)]
enum Callee {
    User(usize),
    Builtin(Builtin),
}

struct Generator<'t, 'a> {
    table: &'t SymbolTable<'a>,
    constants: Vec<Constant>,

    /// Functions visible at the declaration point of each nested function.
    inherited: HashMap<usize, Vec<SymbolKey>>,

    /// Variables declared as arrays. They hold a pointer and are never narrowed.
    arrays: HashSet<SymbolKey>,

    /// Visible declarations of the function being generated, innermost last.
    scope: Vec<SymbolKey>,
    calls: Vec<usize>,
    current: usize,

    errors: Vec<GenerateError>,
    logger: Logger,
}

/// Generates symbolic code for every function in `table`.
///
/// # Errors
/// Every undeclared name, arity mismatch and misuse of `void` found in the program.
pub fn generate<'a, L>(table: &SymbolTable<'a>, logger: L) -> Result<Module, Vec<GenerateError>>
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "codegen"));

    let mut generator = Generator {
        table,
        constants: Vec::new(),
        inherited: HashMap::new(),
        arrays: HashSet::new(),
        scope: Vec::new(),
        calls: Vec::new(),
        current: 0,
        errors: Vec::new(),
        logger,
    };

    // Parents come before their nested functions, so scopes are always inherited in time.
    let functions = (0..table.functions().len())
        .map(|index| generator.function(index))
        .collect();

    if !generator.errors.is_empty() {
        return Err(generator.errors);
    }

    debug!(generator.logger, "module generated"; "constants" => generator.constants.len());

    Ok(Module {
        functions,
        constants: generator.constants,
    })
}

impl<'t, 'a> Generator<'t, 'a> {
    fn function(&mut self, index: usize) -> GeneratedFunction {
        let table = self.table;
        let record = &table.functions()[index];

        self.current = index;
        self.calls.clear();
        self.scope = table.top_level().to_vec();

        if let Some(inherited) = self.inherited.remove(&index) {
            self.scope.extend(inherited);
        }

        self.scope.extend(record.params.iter().map(|param| SymbolKey::variable(param.name.as_str(), param.position)));

        let mut body = Vec::new();

        for _ in 0..record.locals {
            body.push(Instruction::Push(Arg::immediate(0)));
        }

        self.nodes(record.body, &mut body);

        let exit = body.len();

        for _ in 0..record.locals {
            body.push(Instruction::Pop);
        }

        body.push(if record.is_program() { Instruction::Halt } else { Instruction::Ret });

        debug!(self.logger, "function generated";
            "function" => %record.key,
            "instructions" => body.len(),
            "calls" => self.calls.len());

        for (i, instruction) in body.iter().enumerate() {
            trace!(self.logger, "{}", instruction; "function" => %record.key, "index" => i);
        }

        GeneratedFunction {
            key: record.key.clone(),
            index,
            body,
            exit,
            calls: std::mem::replace(&mut self.calls, Vec::new()),
        }
    }

    fn nodes(&mut self, nodes: &[Node], out: &mut Vec<SymbolicInstruction>) {
        for node in nodes {
            self.node(node, out);
        }
    }

    /// Generates a nested block. Declarations inside it go out of scope at its end.
    fn block(&mut self, nodes: &[Node]) -> Vec<SymbolicInstruction> {
        let mark = self.scope.len();
        let mut out = Vec::new();

        self.nodes(nodes, &mut out);
        self.scope.truncate(mark);

        out
    }

    fn declare(&mut self, key: SymbolKey) {
        if !self.scope.contains(&key) {
            self.scope.push(key);
        }
    }

    fn node(&mut self, node: &Node, out: &mut Vec<SymbolicInstruction>) {
        match &node.kind {
            NodeKind::Instructions(body) => {
                let code = self.block(body);
                out.extend(code);
            },
            NodeKind::Branching(branching) => self.branching(branching, out),
            NodeKind::DeclareVariable { decl, value } => {
                self.formula(value, out);

                let key = SymbolKey::variable(decl.name.as_str(), decl.position);
                self.declare(key.clone());

                out.push(Instruction::Pop);
                self.store(&key, out);
            },
            NodeKind::DeclareArray { decl, size } => {
                if let Some(count) = size.fold() {
                    if count <= 0 {
                        self.errors.push(GenerateError::NonPositiveArraySize {
                            name: decl.name.clone(),
                            size: count,
                            position: size.position,
                        });
                    }
                }

                self.formula(size, out);

                let key = SymbolKey::variable(decl.name.as_str(), decl.position);
                self.declare(key.clone());
                self.arrays.insert(key.clone());

                let malloc = match decl.ty.element_size() {
                    1 => Interrupt::Malloc8,
                    2 => Interrupt::Malloc16,
                    _ => Interrupt::Malloc32,
                };

                out.push(Instruction::Pop);
                out.push(Instruction::Int(malloc));
                out.push(Instruction::Store { register: EAX, operand: Arg::address(key) });
            },
            NodeKind::DeclareFunction(function) => {
                let key = SymbolKey::function(function.decl.name.as_str(), function.decl.position);
                self.declare(key.clone());

                if let Some(index) = self.table.function_index(&key) {
                    let visible = self.scope.iter()
                        .filter(|key| key.category == Category::Function)
                        .cloned()
                        .collect();

                    self.inherited.insert(index, visible);
                }
            },
            NodeKind::Assign { name, value } => {
                self.formula(value, out);
                out.push(Instruction::Pop);

                if let Some(key) = self.variable(name, node.position) {
                    self.store(&key, out);
                }
            },
            NodeKind::AssignArray { name, index, value } => {
                self.formula(index, out);
                self.formula(value, out);

                if let Some(key) = self.variable(name, node.position) {
                    self.fetch(&key, out);
                    out.push(Instruction::Alu { op: AluOp::Add, register: EAX, operand: Arg::Fixed(Operand::relative(Base::StackPointer, -1).deref()) });
                    out.push(Instruction::Swap(Arg::stack(0)));
                    out.push(Instruction::Store {
                        register: Reg::ElementOf(key),
                        operand: Arg::Fixed(Operand::relative(Base::StackPointer, 0).deref()),
                    });
                }

                out.push(Instruction::Pop);
                out.push(Instruction::Pop);
            },
            NodeKind::EvalProcedure { name, args } => self.call(name, args, node.position, false, out),
            NodeKind::Return(value) => {
                let returns = self.table.functions()[self.current].return_type != Type::Void;

                match value {
                    Some(_) if !returns => {
                        self.errors.push(GenerateError::UnexpectedReturnValue { position: node.position });
                    },
                    Some(value) => {
                        self.formula(value, out);
                        out.push(Instruction::Pop);

                        if let Some(key) = self.variable(RETURN_SLOT, node.position) {
                            out.push(Instruction::Store { register: EAX, operand: Arg::address(key) });
                        }
                    },
                    None => (),
                }

                out.push(Instruction::Jump { condition: Condition::Always, operand: Arg::Exit });
            },
        }
    }

    /// Pops the condition value and sets the flags for a test against zero.
    fn test(out: &mut Vec<SymbolicInstruction>) {
        out.push(Instruction::Pop);
        out.push(Instruction::Alu { op: AluOp::Cmp, register: EAX, operand: Arg::immediate(0) });
    }

    fn branching(&mut self, branching: &Branching, out: &mut Vec<SymbolicInstruction>) {
        match branching {
            Branching::If { condition, body } => {
                self.formula(condition, out);
                let body = self.block(body);

                Generator::test(out);
                out.push(Instruction::Jump { condition: Condition::Equal, operand: Arg::ip(body.len()) });
                out.extend(body);
            },
            Branching::While { condition, body } => {
                let mut test = Vec::new();
                self.formula(condition, &mut test);
                let body = self.block(body);

                let back = body.len() + test.len() + 4;

                out.extend(test);
                Generator::test(out);
                out.push(Instruction::Jump { condition: Condition::Equal, operand: Arg::ip(body.len() + 1) });
                out.extend(body);
                out.push(Instruction::Jump { condition: Condition::Always, operand: Arg::ip_back(back) });
            },
            Branching::DoWhile { body, condition } => {
                let body = self.block(body);
                let mut test = Vec::new();
                self.formula(condition, &mut test);

                let back = test.len() + body.len() + 3;

                out.extend(body);
                out.extend(test);
                Generator::test(out);
                out.push(Instruction::Jump { condition: Condition::NotEqual, operand: Arg::ip_back(back) });
            },
            Branching::For { init, condition, step, body } => {
                let mark = self.scope.len();

                self.node(init, out);
                let body = self.block(body);

                let mut step_code = Vec::new();
                self.node(step, &mut step_code);

                let mut test = Vec::new();
                self.formula(condition, &mut test);

                self.scope.truncate(mark);

                // Like `do`, the body runs once before the condition is first tested.
                let back = body.len() + step_code.len() + test.len() + 3;

                out.extend(body);
                out.extend(step_code);
                out.extend(test);
                Generator::test(out);
                out.push(Instruction::Jump { condition: Condition::NotEqual, operand: Arg::ip_back(back) });
            },
        }
    }

    /// Pushes the value of `formula`.
    fn formula(&mut self, formula: &Formula, out: &mut Vec<SymbolicInstruction>) {
        match &formula.kind {
            FormulaKind::Number(n) => {
                if *n >= i32::from(i16::min_value()) && *n <= i32::from(i16::max_value()) {
                    out.push(Instruction::Push(Arg::immediate(*n)));
                } else {
                    let index = self.constant(Constant::Word(*n));
                    out.push(Instruction::Push(Arg::Symbol {
                        placeholder: Placeholder::GlobalConstant(index),
                        indirect: true,
                    }));
                }
            },
            FormulaKind::String(text) => {
                let index = self.constant(Constant::Bytes(text.bytes().collect()));
                out.push(Instruction::Push(Arg::Symbol {
                    placeholder: Placeholder::GlobalConstant(index),
                    indirect: false,
                }));
            },
            FormulaKind::Variable(name) => match self.variable(name, formula.position) {
                Some(key) => {
                    self.fetch(&key, out);
                    out.push(Instruction::Push(Arg::accumulator()));
                },
                None => out.push(Instruction::Push(Arg::immediate(0))),
            },
            FormulaKind::CalcFunction { name, args } => self.call(name, args, formula.position, true, out),
            FormulaKind::CalcArray { name, index } => {
                self.formula(index, out);

                if let Some(key) = self.variable(name, formula.position) {
                    self.fetch(&key, out);
                    out.push(Instruction::Alu { op: AluOp::Add, register: EAX, operand: Arg::Fixed(Operand::relative(Base::StackPointer, 0).deref()) });
                    out.push(Instruction::Load {
                        register: Reg::ElementOf(key.clone()),
                        operand: Arg::Fixed(Operand::relative(Base::Accumulator, 0).deref()),
                    });

                    match self.table.get_symbol(&key).map(|symbol| symbol.ty) {
                        Some(Type::Int8) => out.push(Instruction::Unary(UnaryOp::Ext8)),
                        Some(Type::Int16) => out.push(Instruction::Unary(UnaryOp::Ext16)),
                        _ => (),
                    }

                    out.push(Instruction::Store { register: EAX, operand: Arg::stack(0) });
                }
            },
            FormulaKind::Binary { op, lhs, rhs } => {
                self.formula(lhs, out);
                self.formula(rhs, out);
                Generator::binary(*op, out);
            },
        }
    }

    /// Combines the two topmost stack words into one.
    ///
    /// After the `POP` the accumulator holds the right operand and `[SP]` the left one.
    fn binary(op: BinaryOperator, out: &mut Vec<SymbolicInstruction>) {
        out.push(Instruction::Pop);

        let top = Arg::Fixed(Operand::relative(Base::StackPointer, 0).deref());

        if op.is_comparison() {
            // Flags come from `right - left`.
            let condition = match op {
                BinaryOperator::Equal => Condition::Equal,
                BinaryOperator::NotEqual => Condition::NotEqual,
                BinaryOperator::Less => Condition::Greater,
                _ => Condition::Less,
            };

            out.push(Instruction::Alu { op: AluOp::Cmp, register: EAX, operand: top });
            out.push(Instruction::Jump { condition, operand: Arg::ip(2) });
            out.push(Instruction::Load { register: EAX, operand: Arg::immediate(0) });
            out.push(Instruction::Jump { condition: Condition::Always, operand: Arg::ip(1) });
            out.push(Instruction::Load { register: EAX, operand: Arg::immediate(-1) });
        } else {
            let alu = match op {
                BinaryOperator::Mod => AluOp::Mod,
                BinaryOperator::Mul => AluOp::Mul,
                BinaryOperator::Add => AluOp::Add,
                BinaryOperator::Sub => AluOp::Sub,
                BinaryOperator::ShiftRight => AluOp::Shr,
                BinaryOperator::ShiftLeft => AluOp::Shl,
                BinaryOperator::And => AluOp::And,
                _ => AluOp::Or,
            };

            if !op.is_commutative() {
                out.push(Instruction::Swap(Arg::stack(0)));
            }

            out.push(Instruction::Alu { op: alu, register: EAX, operand: top });
        }

        out.push(Instruction::Store { register: EAX, operand: Arg::stack(0) });
    }

    /// Loads a variable into the accumulator, sign-extending sub-word globals.
    fn fetch(&mut self, key: &SymbolKey, out: &mut Vec<SymbolicInstruction>) {
        out.push(Instruction::Load { register: Reg::Of(key.clone()), operand: Arg::memory(key.clone()) });

        if let Some(symbol) = self.table.get_symbol(key) {
            if symbol.is_global() {
                match symbol.size {
                    1 => out.push(Instruction::Unary(UnaryOp::Ext8)),
                    2 => out.push(Instruction::Unary(UnaryOp::Ext16)),
                    _ => (),
                }
            }
        }
    }

    /// Stores the accumulator into a variable. Locals take a whole word, so sub-word locals are
    /// narrowed first.
    fn store(&mut self, key: &SymbolKey, out: &mut Vec<SymbolicInstruction>) {
        if let Some(symbol) = self.table.get_symbol(key) {
            if !symbol.is_global() && !self.arrays.contains(key) {
                match symbol.ty {
                    Type::Int8 => out.push(Instruction::Unary(UnaryOp::Ext8)),
                    Type::Int16 => out.push(Instruction::Unary(UnaryOp::Ext16)),
                    _ => (),
                }
            }
        }

        out.push(Instruction::Store { register: Reg::Of(key.clone()), operand: Arg::address(key.clone()) });
    }

    fn call(&mut self, name: &str, args: &[Formula], position: Position, value: bool, out: &mut Vec<SymbolicInstruction>) {
        let callee = match self.callee(name, args.len(), position) {
            Some(callee) => callee,
            None => {
                for arg in args {
                    self.formula(arg, out);
                    out.push(Instruction::Pop);
                }

                if value {
                    out.push(Instruction::Push(Arg::immediate(0)));
                }

                return;
            },
        };

        let table = self.table;

        let returns = match callee {
            Callee::User(index) => {
                let record = &table.functions()[index];
                let returns = record.return_type != Type::Void;

                if returns {
                    out.push(Instruction::Push(Arg::immediate(0)));
                }

                for arg in args {
                    self.formula(arg, out);
                }

                out.push(Instruction::Call {
                    condition: Condition::Always,
                    operand: Arg::Symbol { placeholder: Placeholder::Function(record.key.clone()), indirect: false },
                });

                for _ in args {
                    out.push(Instruction::Pop);
                }

                if !self.calls.contains(&index) {
                    self.calls.push(index);
                }

                returns
            },
            Callee::Builtin(builtin) => {
                for arg in args {
                    self.formula(arg, out);
                    out.push(Instruction::Pop);
                }

                match builtin {
                    Builtin::Out => out.push(Instruction::Int(Interrupt::Out)),
                    Builtin::In => {
                        out.push(Instruction::Int(Interrupt::In));

                        if value {
                            out.push(Instruction::Push(Arg::accumulator()));
                        }
                    },
                    Builtin::Halt => out.push(Instruction::Halt),
                }

                builtin == Builtin::In
            },
        };

        match (value, returns) {
            (true, false) => {
                self.errors.push(GenerateError::VoidInExpression { name: name.to_string(), position });
                out.push(Instruction::Push(Arg::immediate(0)));
            },
            (false, true) => {
                if let Callee::User(_) = callee {
                    out.push(Instruction::Pop);
                }
            },
            _ => (),
        }
    }

    /// Finds the closest visible variable named `name`.
    fn variable(&mut self, name: &str, position: Position) -> Option<SymbolKey> {
        let found = self.scope.iter()
            .rev()
            .find(|key| key.category == Category::Variable && key.name == name)
            .cloned();

        if found.is_none() {
            let suggestion = self.suggest(name, Category::Variable);

            self.errors.push(GenerateError::Undeclared {
                name: name.to_string(),
                position,
                suggestion,
            });
        }

        found
    }

    /// Finds the closest visible function named `name` taking `arity` arguments, falling back to
    /// the built-in procedures.
    fn callee(&mut self, name: &str, arity: usize, position: Position) -> Option<Callee> {
        let table = self.table;
        let mut expected = None;

        for key in self.scope.iter().rev() {
            if key.category != Category::Function || key.name != name {
                continue;
            }

            if let Some(index) = table.function_index(key) {
                let declared = table.functions()[index].arity();

                if declared == arity {
                    return Some(Callee::User(index));
                }

                expected.get_or_insert(declared);
            }
        }

        if let Some(builtin) = Builtin::find(name, arity) {
            return Some(Callee::Builtin(builtin));
        }

        let error = match expected {
            Some(expected) => GenerateError::ArityMismatch {
                name: name.to_string(),
                expected,
                found: arity,
                position,
            },
            None => GenerateError::UndeclaredFunction {
                name: name.to_string(),
                arity,
                position,
                suggestion: self.suggest(name, Category::Function),
            },
        };

        self.errors.push(error);

        None
    }

    /// The visible name closest to a misspelled one, if any is close enough.
    fn suggest(&self, name: &str, category: Category) -> Option<String> {
        let builtins = Builtin::ALL.iter()
            .filter(|_| category == Category::Function)
            .map(|(name, _, _)| *name);

        self.scope.iter()
            .filter(|key| key.category == category && key.name != RETURN_SLOT)
            .map(|key| key.name.as_str())
            .chain(builtins)
            .map(|candidate| (edit_distance(name, candidate), candidate))
            .filter(|(distance, _)| *distance > 0 && *distance <= 2 && *distance < name.len())
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| candidate.to_string())
    }

    fn constant(&mut self, constant: Constant) -> usize {
        match self.constants.iter().position(|existing| *existing == constant) {
            Some(index) => index,
            None => {
                self.constants.push(constant);
                self.constants.len() - 1
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;
    use crate::symbol_table::resolve;
    use crate::ast::Program;

    fn program(source: &str) -> Program {
        parse(tokenize(source, None).unwrap(), None).unwrap()
    }

    fn generate_source(source: &str) -> Result<Module, Vec<GenerateError>> {
        let program = program(source);
        let (table, errors) = resolve(&program, None);
        assert!(errors.is_empty(), "resolve errors: {:?}", errors);

        generate(&table, None)
    }

    fn lines(function: &GeneratedFunction) -> Vec<String> {
        function.body.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_straight_line() {
        let module = generate_source("int32 a = 2\nOUT(a)").unwrap();

        assert_eq!(lines(&module.functions[0]), vec![
            "PUSH 2",
            "POP",
            "MOV [%v:a:0%], %r:v:a:0%",
            "MOV %r:v:a:0%, [%v:a:0%]",
            "PUSH A",
            "POP",
            "INT OUT",
            "HALT",
        ]);
    }

    #[test]
    fn test_operand_order() {
        let module = generate_source("OUT(7 - 2 < 9)").unwrap();

        assert_eq!(lines(&module.functions[0]), vec![
            "PUSH 7",
            "PUSH 2",
            "POP",
            "SWAP [SP]",
            "ALU SUB EAX, [SP]",
            "MOV [SP], EAX",
            "PUSH 9",
            "POP",
            "ALU CMP EAX, [SP]",
            "JMP G IP+2",
            "MOV EAX, 0",
            "JMP IP+1",
            "MOV EAX, -1",
            "MOV [SP], EAX",
            "POP",
            "INT OUT",
            "HALT",
        ]);
    }

    #[test]
    fn test_while_offsets() {
        let module = generate_source("int32 i = 0\nwhile (i < 3) { i = i + 1 }").unwrap();
        let text = lines(&module.functions[0]);

        // cond is 10 instructions, body is 8
        assert_eq!(text[15], "JMP E IP+9");
        assert_eq!(text[24], "JMP IP-22");
        assert_eq!(text.len(), 26);
    }

    #[test]
    fn test_function_frame() {
        let module = generate_source("int32 f(int32 x) { int32 y = x\n return y }\nOUT(f(4))").unwrap();
        let f = &module.functions[1];

        assert_eq!(f.key, SymbolKey::function("f", 0));
        assert_eq!(f.body.first(), Some(&Instruction::Push(Arg::immediate(0))));
        assert_eq!(lines(f)[f.exit..].to_vec(), vec!["POP", "RET"]);
        assert!(lines(f).contains(&"JMP %exit%".to_string()));
        assert_eq!(module.functions[0].calls, vec![1]);

        let main = lines(&module.functions[0]);
        assert_eq!(main[..5].to_vec(), vec!["PUSH 0", "PUSH 4", "CALL %f:f:0%", "POP", "POP"]);
    }

    #[test]
    fn test_constants_are_shared() {
        let module = generate_source("str a = \"hi\"\nstr b = \"hi\"\nint32 c = 70000\nint32 d = 70000").unwrap();

        assert_eq!(module.constants, vec![Constant::Bytes(b"hi".to_vec()), Constant::Word(70000)]);
        assert_eq!(module.constants[0].words(), 1);
        assert!(lines(&module.functions[0]).contains(&"PUSH [%c:1%]".to_string()));
    }

    #[test]
    fn test_builtins_can_be_shadowed() {
        let module = generate_source("void OUT(int32 a, int32 b) {}\nOUT(1)\nOUT(1, 2)").unwrap();
        let main = lines(&module.functions[0]);

        assert!(main.contains(&"INT OUT".to_string()));
        assert!(main.contains(&"CALL %f:OUT:0%".to_string()));
    }

    #[test]
    fn test_name_errors() {
        let errors = generate_source("int32 count = 1\nint32 f(int32 x) { return x }\nOUT(f(1, 2))\nOUT(g(1))\nOUT(cuont)").unwrap_err();

        assert_eq!(errors.len(), 3);
        assert!(match &errors[0] {
            GenerateError::ArityMismatch { name, expected: 1, found: 2, .. } => name == "f",
            _ => false,
        });
        assert!(match &errors[1] {
            GenerateError::UndeclaredFunction { name, arity: 1, .. } => name == "g",
            _ => false,
        });
        assert!(match &errors[2] {
            GenerateError::Undeclared { name, suggestion: Some(suggestion), .. } => name == "cuont" && suggestion == "count",
            _ => false,
        });
    }

    #[test]
    fn test_misuse_errors() {
        let errors = generate_source("void f() { return 1 }\nint32 x = f()\nint8 a[0]").unwrap_err();

        assert_eq!(errors.len(), 3);
        assert!(match errors[0] { GenerateError::VoidInExpression { .. } => true, _ => false });
        assert!(match errors[1] { GenerateError::NonPositiveArraySize { size: 0, .. } => true, _ => false });
        assert!(match errors[2] { GenerateError::UnexpectedReturnValue { .. } => true, _ => false });
    }

    #[test]
    fn test_computed_array_sizes() {
        let errors = generate_source("int32 a[1 - 1]\nint16 b[2 - 3]\nint8 c[2 * 2]").unwrap_err();

        assert_eq!(errors.len(), 2);
        assert!(match &errors[0] { GenerateError::NonPositiveArraySize { name, size: 0, .. } => name == "a", _ => false });
        assert!(match &errors[1] { GenerateError::NonPositiveArraySize { name, size: -1, .. } => name == "b", _ => false });

        // Known only at run time.
        assert!(generate_source("int32 n = 2\nint32 d[n - 3]").is_ok());
    }

    #[test]
    fn test_nested_functions_do_not_capture_locals() {
        let errors = generate_source("void f() {\n int32 y = 2\n void g() { OUT(y) }\n g()\n}").unwrap_err();

        assert_eq!(errors.len(), 1);
        assert!(match &errors[0] { GenerateError::Undeclared { name, .. } => name == "y", _ => false });

        assert!(generate_source("void f() {\n void g() { OUT(1) }\n void h() { g() }\n h()\n}\nf()").is_ok());
    }

    #[test]
    fn test_block_scope_ends() {
        let errors = generate_source("if (1) { int32 t = 1 }\nOUT(t)").unwrap_err();

        assert!(match &errors[0] { GenerateError::Undeclared { name, .. } => name == "t", _ => false });
    }
}
