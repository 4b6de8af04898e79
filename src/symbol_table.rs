//! Symbol resolution.
//!
//! Walks the [AST](crate::ast) once, assigns storage to every declared variable and lifts every
//! function into a flat list of [FunctionRecord]s. Function bodies are visited breadth-first, so
//! a function always has a larger index than the function it is declared in.

use slog::{debug, o, trace, Discard, Logger};

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::ast::{Branching, Declaration, Function, Node, NodeKind, Parameter, Position, Program, Type};
use crate::codegen::GenerateError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Variable,
    Function,
}

/// Identity of a declaration. Two declarations of the same name at different positions are
/// distinct symbols, which is what makes shadowing work.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolKey {
    pub category: Category,
    pub name: String,
    pub position: Position,
}

impl SymbolKey {
    pub fn variable<S: Into<String>>(name: S, position: Position) -> SymbolKey {
        SymbolKey {
            category: Category::Variable,
            name: name.into(),
            position,
        }
    }

    pub fn function<S: Into<String>>(name: S, position: Position) -> SymbolKey {
        SymbolKey {
            category: Category::Function,
            name: name.into(),
            position,
        }
    }

    /// Key of the implicit function wrapping the top-level statements.
    pub fn program() -> SymbolKey {
        SymbolKey::function("", 0)
    }
}

impl fmt::Display for SymbolKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let category = match self.category {
            Category::Variable => 'v',
            Category::Function => 'f',
        };

        write!(f, "{}:{}:{}", category, self.name, self.position)
    }
}

/// Where the value of a symbol lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Storage {
    /// Byte offset into the globals region.
    Global { offset: u32 },

    /// Index of a word in the frame of the owning function, in declaration order.
    Local { slot: usize },

    /// Argument `index` of `count`, counting the implicit return slot.
    Parameter { index: usize, count: usize },

    /// Index into [SymbolTable::functions].
    Function { index: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Symbol {
    pub key: SymbolKey,
    pub ty: Type,
    pub storage: Storage,

    /// Size in bytes of the storage cell.
    pub size: u32,

    /// Index of the function the symbol is declared in.
    pub owner: usize,
}

impl Symbol {
    pub fn is_global(&self) -> bool {
        match self.storage {
            Storage::Global { .. } => true,
            _ => false,
        }
    }
}

/// A function lifted out of the tree.
#[derive(Clone, Debug)]
pub struct FunctionRecord<'a> {
    pub key: SymbolKey,
    pub return_type: Type,
    pub params: &'a [Parameter],
    pub body: &'a [Node],

    /// Number of local word slots the frame needs.
    pub locals: usize,

    /// Index of the function this one is declared in. `None` only for the program itself.
    pub parent: Option<usize>,
}

impl<'a> FunctionRecord<'a> {
    /// Number of arguments a call site passes explicitly.
    pub fn arity(&self) -> usize {
        match self.return_type {
            Type::Void => self.params.len(),
            _ => self.params.len().saturating_sub(1),
        }
    }

    pub fn is_program(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct SymbolTable<'a> {
    symbols: HashMap<SymbolKey, Symbol>,
    functions: Vec<FunctionRecord<'a>>,
    top_level: Vec<SymbolKey>,
    globals_size: u32,
}

impl<'a> SymbolTable<'a> {
    fn new(program: &'a Program) -> SymbolTable<'a> {
        SymbolTable {
            symbols: HashMap::new(),
            functions: vec![FunctionRecord {
                key: SymbolKey::program(),
                return_type: Type::Void,
                params: &[],
                body: &program.body,
                locals: 0,
                parent: None,
            }],
            top_level: Vec::new(),
            globals_size: 0,
        }
    }

    pub fn get_symbol(&self, key: &SymbolKey) -> Option<&Symbol> {
        self.symbols.get(key)
    }

    pub fn symbols(&self) -> impl Iterator<Item=&Symbol> {
        self.symbols.values()
    }

    pub fn functions(&self) -> &[FunctionRecord<'a>] {
        &self.functions[..]
    }

    pub fn function(&self, index: usize) -> Option<&FunctionRecord<'a>> {
        self.functions.get(index)
    }

    /// Index of the function declared with `key`.
    pub fn function_index(&self, key: &SymbolKey) -> Option<usize> {
        match self.symbols.get(key)?.storage {
            Storage::Function { index } => Some(index),
            _ => None,
        }
    }

    /// Symbols declared directly in the program body, in textual order.
    pub fn top_level(&self) -> &[SymbolKey] {
        &self.top_level[..]
    }

    /// Size of the globals region in bytes.
    pub fn globals_size(&self) -> u32 {
        self.globals_size
    }

    /// Size of the globals region in whole words.
    pub fn globals_words(&self) -> u32 {
        (self.globals_size + 3) / 4
    }

    fn insert(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.key.clone(), symbol);
    }
}

struct Resolver<'a> {
    table: SymbolTable<'a>,
    errors: Vec<GenerateError>,
    queue: VecDeque<usize>,
    logger: Logger,
}

/// Builds the symbol table of `program`.
///
/// Resolution never stops early: the table is always complete and every declaration error is
/// returned alongside it.
pub fn resolve<'a, L>(program: &'a Program, logger: L) -> (SymbolTable<'a>, Vec<GenerateError>)
where
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "resolve"));

    let mut resolver = Resolver {
        table: SymbolTable::new(program),
        errors: Vec::new(),
        queue: VecDeque::new(),
        logger,
    };

    resolver.walk(0, &program.body, true);

    while let Some(index) = resolver.queue.pop_front() {
        resolver.resolve_function(index);
    }

    debug!(resolver.logger, "symbols resolved";
        "functions" => resolver.table.functions.len(),
        "globals_size" => resolver.table.globals_size);

    (resolver.table, resolver.errors)
}

impl<'a> Resolver<'a> {
    fn resolve_function(&mut self, index: usize) {
        let (params, body) = {
            let record = &self.table.functions[index];
            (record.params, record.body)
        };

        let count = params.len();

        for (i, param) in params.iter().enumerate() {
            if param.ty == Type::Void {
                self.errors.push(GenerateError::VoidVariable {
                    name: param.name.clone(),
                    position: param.position,
                });
            }

            self.table.insert(Symbol {
                key: SymbolKey::variable(param.name.as_str(), param.position),
                ty: param.ty,
                storage: Storage::Parameter { index: i, count },
                size: 4,
                owner: index,
            });
        }

        self.walk(index, body, false);

        let record = &self.table.functions[index];
        debug!(self.logger, "function resolved";
            "function" => %record.key,
            "params" => count,
            "locals" => record.locals);
    }

    fn walk(&mut self, function: usize, nodes: &'a [Node], top_level: bool) {
        for node in nodes {
            match &node.kind {
                NodeKind::DeclareVariable { decl, .. } => self.declare_variable(function, decl, false, top_level),
                NodeKind::DeclareArray { decl, .. } => self.declare_variable(function, decl, true, top_level),
                NodeKind::DeclareFunction(declared) => self.declare_function(function, declared, top_level),
                NodeKind::Instructions(body) => self.walk(function, body, false),
                NodeKind::Branching(branching) => match branching {
                    Branching::DoWhile { body, .. }
                    | Branching::While { body, .. }
                    | Branching::If { body, .. } => self.walk(function, body, false),
                    Branching::For { init, step, body, .. } => {
                        self.walk(function, std::slice::from_ref(&**init), false);
                        self.walk(function, body, false);
                        self.walk(function, std::slice::from_ref(&**step), false);
                    },
                },
                NodeKind::Assign { .. }
                | NodeKind::AssignArray { .. }
                | NodeKind::EvalProcedure { .. }
                | NodeKind::Return(_) => (),
            }
        }
    }

    fn declare_variable(&mut self, function: usize, decl: &Declaration, array: bool, top_level: bool) {
        if decl.ty == Type::Void {
            self.errors.push(GenerateError::VoidVariable {
                name: decl.name.clone(),
                position: decl.position,
            });
        }

        let key = SymbolKey::variable(decl.name.as_str(), decl.position);

        let (storage, size) = if top_level {
            // Arrays hold a pointer to their elements.
            let size = match decl.ty {
                _ if array => 4,
                Type::Void => 4,
                ty => ty.size(),
            };

            let offset = (self.table.globals_size + size - 1) / size * size;
            self.table.globals_size = offset + size;

            (Storage::Global { offset }, size)
        } else {
            let record = &mut self.table.functions[function];
            let slot = record.locals;
            record.locals += 1;

            (Storage::Local { slot }, 4)
        };

        trace!(self.logger, "variable"; "symbol" => %key, "storage" => ?storage);

        if top_level {
            self.table.top_level.push(key.clone());
        }

        self.table.insert(Symbol {
            key,
            ty: decl.ty,
            storage,
            size,
            owner: function,
        });
    }

    fn declare_function(&mut self, parent: usize, declared: &'a Function, top_level: bool) {
        let key = SymbolKey::function(declared.decl.name.as_str(), declared.decl.position);
        let index = self.table.functions.len();

        self.table.functions.push(FunctionRecord {
            key: key.clone(),
            return_type: declared.decl.ty,
            params: &declared.params,
            body: &declared.body,
            locals: 0,
            parent: Some(parent),
        });

        trace!(self.logger, "function"; "symbol" => %key, "index" => index, "parent" => parent);

        if top_level {
            self.table.top_level.push(key.clone());
        }

        self.table.insert(Symbol {
            key,
            ty: declared.decl.ty,
            storage: Storage::Function { index },
            size: 0,
            owner: parent,
        });

        self.queue.push_back(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn program(source: &str) -> Program {
        parse(tokenize(source, None).unwrap(), None).unwrap()
    }

    fn find<'t>(table: &'t SymbolTable, name: &str) -> &'t Symbol {
        table.symbols()
            .find(|symbol| symbol.key.name == name)
            .unwrap_or_else(|| panic!("no symbol named {}", name))
    }

    #[test]
    fn test_global_alignment() {
        let program = program("int8 a = 1\nint32 b = 2\nint16 c = 3\nint8 d = 4\nint16 e[2]");
        let (table, errors) = resolve(&program, None);

        assert!(errors.is_empty());
        assert_eq!(find(&table, "a").storage, Storage::Global { offset: 0 });
        assert_eq!(find(&table, "b").storage, Storage::Global { offset: 4 });
        assert_eq!(find(&table, "c").storage, Storage::Global { offset: 8 });
        assert_eq!(find(&table, "d").storage, Storage::Global { offset: 10 });
        assert_eq!(find(&table, "e").storage, Storage::Global { offset: 12 });
        assert_eq!(table.globals_size(), 16);
        assert_eq!(table.globals_words(), 4);
    }

    #[test]
    fn test_nested_declarations_are_locals() {
        let program = program("for (int32 i = 0; i < 3; i = i + 1) { int8 x = i }\nint32 g = 0");
        let (table, _) = resolve(&program, None);

        assert_eq!(find(&table, "i").storage, Storage::Local { slot: 0 });
        assert_eq!(find(&table, "x").storage, Storage::Local { slot: 1 });
        assert!(find(&table, "g").is_global());
        assert_eq!(table.functions()[0].locals, 2);
        assert_eq!(table.top_level(), &[SymbolKey::variable("g", 51)]);
    }

    #[test]
    fn test_functions_and_parameters() {
        let program = program("int32 f(int32 x, int8 y) {\n int32 z = x\n void g() { OUT(1) }\n}");
        let (table, errors) = resolve(&program, None);

        assert!(errors.is_empty());

        let f = table.function_index(&SymbolKey::function("f", 0)).unwrap();
        let g = table.functions().iter().position(|r| r.key.name == "g").unwrap();

        assert_eq!(f, 1);
        assert_eq!(g, 2);
        assert_eq!(table.functions()[g].parent, Some(f));
        assert_eq!(table.functions()[f].arity(), 2);
        assert_eq!(table.functions()[f].locals, 1);

        assert_eq!(find(&table, "return").storage, Storage::Parameter { index: 0, count: 3 });
        assert_eq!(find(&table, "y").storage, Storage::Parameter { index: 2, count: 3 });
        assert_eq!(find(&table, "z").storage, Storage::Local { slot: 0 });
        assert_eq!(find(&table, "z").owner, f);
    }

    #[test]
    fn test_breadth_first_order() {
        let program = program("void a() { void c() {} }\nvoid b() {}");
        let (table, _) = resolve(&program, None);

        let names = table.functions().iter().map(|r| r.key.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["", "a", "b", "c"]);
    }

    #[test]
    fn test_void_variables_are_reported() {
        let program = program("void v = 1\nvoid f(void p) {}");
        let (_, errors) = resolve(&program, None);

        assert_eq!(errors, vec![
            GenerateError::VoidVariable { name: "v".to_string(), position: 0 },
            GenerateError::VoidVariable { name: "p".to_string(), position: 18 },
        ]);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SymbolKey::variable("x", 12).to_string(), "v:x:12");
        assert_eq!(SymbolKey::function("f", 3).to_string(), "f:f:3");
    }
}
