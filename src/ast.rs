//! Abstract syntax tree of the source language.
//!
//! Every node owns its children. Positions are byte offsets into the source text and, together
//! with the declared name, identify declarations for the [symbol table](crate::symbol_table).

use std::fmt;

/// Byte offset into the source text.
pub type Position = usize;

/// Surface type tags. Only the storage size is derived from these, no type checking is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Int32,
    Int16,
    Int8,
    Str,
    Void,
}

impl Type {
    /// Size in bytes of a scalar variable of this type.
    ///
    /// A `str` variable holds the byte address of its first character, so it takes a full word.
    pub fn size(self) -> u32 {
        match self {
            Type::Int8 => 1,
            Type::Int16 => 2,
            Type::Int32 | Type::Str => 4,
            Type::Void => 0,
        }
    }

    /// Size in bytes of one element when a variable of this type is indexed.
    pub fn element_size(self) -> u32 {
        match self {
            Type::Int8 | Type::Str => 1,
            Type::Int16 => 2,
            Type::Int32 => 4,
            Type::Void => 0,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", match self {
            Type::Int32 => "int32",
            Type::Int16 => "int16",
            Type::Int8 => "int8",
            Type::Str => "str",
            Type::Void => "void",
        })
    }
}

/// Binary operators usable inside a [Formula].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Mod,
    Mul,
    Add,
    Sub,
    ShiftRight,
    ShiftLeft,
    NotEqual,
    Equal,
    Less,
    Greater,
    And,
    Or,
}

impl BinaryOperator {
    /// Binding strength. Higher binds tighter, equal ranks associate to the left.
    pub fn precedence(self) -> u8 {
        use BinaryOperator::*;

        match self {
            Mod | Mul => 5,
            Add | Sub => 4,
            ShiftRight | ShiftLeft => 3,
            NotEqual | Equal | Less | Greater => 2,
            And | Or => 1,
        }
    }

    /// Operand order does not matter for these.
    pub fn is_commutative(self) -> bool {
        use BinaryOperator::*;

        match self {
            Mul | Add | And | Or => true,
            _ => false,
        }
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOperator::*;

        match self {
            NotEqual | Equal | Less | Greater => true,
            _ => false,
        }
    }

    /// Applies the operator the way the machine does: 32-bit wrapping arithmetic, floored
    /// `%`, shifts clamped at 32 and comparisons yielding `-1` for true.
    ///
    /// Returns `None` where the machine would stop with an arithmetic error.
    pub fn apply(self, left: i32, right: i32) -> Option<i32> {
        use BinaryOperator::*;

        let truth = |holds: bool| if holds { -1 } else { 0 };

        Some(match self {
            Mod if right == 0 => return None,
            Mod => {
                let m = left.wrapping_rem(right);

                if m != 0 && (m < 0) != (right < 0) {
                    m.wrapping_add(right)
                } else {
                    m
                }
            },
            Mul => left.wrapping_mul(right),
            Add => left.wrapping_add(right),
            Sub => left.wrapping_sub(right),
            ShiftRight | ShiftLeft if right < 0 => return None,
            ShiftRight => (i64::from(left) >> right.min(32)) as i32,
            ShiftLeft => ((u64::from(left as u32) << right.min(32)) & 0xFFFF_FFFF) as u32 as i32,
            NotEqual => truth(left != right),
            Equal => truth(left == right),
            Less => truth(left < right),
            Greater => truth(left > right),
            And => left & right,
            Or => left | right,
        })
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use BinaryOperator::*;

        write!(f, "{}", match self {
            Mod => "%",
            Mul => "*",
            Add => "+",
            Sub => "-",
            ShiftRight => ">>",
            ShiftLeft => "<<",
            NotEqual => "!=",
            Equal => "==",
            Less => "<",
            Greater => ">",
            And => "&&",
            Or => "||",
        })
    }
}

/// A typed name introduced by a declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct Declaration {
    pub ty: Type,
    pub name: String,
    pub position: Position,
}

/// A formal parameter of a function.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    pub ty: Type,
    pub name: String,
    pub position: Position,
}

/// Name of the implicit leading parameter that carries the result of a non-void function.
pub const RETURN_SLOT: &str = "return";

/// A function declaration.
///
/// For non-void functions the first entry of `params` is the implicit `int32 return`
/// parameter, positioned at the declaration itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub decl: Declaration,
    pub params: Vec<Parameter>,
    pub body: Vec<Node>,
}

impl Function {
    /// Number of arguments a call site passes explicitly.
    pub fn arity(&self) -> usize {
        match self.decl.ty {
            Type::Void => self.params.len(),
            _ => self.params.len().saturating_sub(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Branching {
    DoWhile {
        body: Vec<Node>,
        condition: Formula,
    },
    While {
        condition: Formula,
        body: Vec<Node>,
    },
    For {
        init: Box<Node>,
        condition: Formula,
        step: Box<Node>,
        body: Vec<Node>,
    },
    If {
        condition: Formula,
        body: Vec<Node>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Instructions(Vec<Node>),
    Branching(Branching),
    DeclareVariable {
        decl: Declaration,
        value: Formula,
    },
    DeclareArray {
        decl: Declaration,
        size: Formula,
    },
    DeclareFunction(Function),
    Assign {
        name: String,
        value: Formula,
    },
    AssignArray {
        name: String,
        index: Formula,
        value: Formula,
    },
    EvalProcedure {
        name: String,
        args: Vec<Formula>,
    },
    Return(Option<Formula>),
}

/// A statement-level node.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub position: Position,
    pub kind: NodeKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FormulaKind {
    Number(i32),
    String(String),
    Variable(String),
    CalcFunction {
        name: String,
        args: Vec<Formula>,
    },
    CalcArray {
        name: String,
        index: Box<Formula>,
    },
    Binary {
        op: BinaryOperator,
        lhs: Box<Formula>,
        rhs: Box<Formula>,
    },
}

/// An expression tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Formula {
    pub position: Position,
    pub kind: FormulaKind,
}

impl Formula {
    /// The value of the formula if it consists of a single number literal.
    pub fn constant(&self) -> Option<i32> {
        match self.kind {
            FormulaKind::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Evaluates a formula built only from number literals and operators.
    pub fn fold(&self) -> Option<i32> {
        match &self.kind {
            FormulaKind::Number(n) => Some(*n),
            FormulaKind::Binary { op, lhs, rhs } => op.apply(lhs.fold()?, rhs.fold()?),
            _ => None,
        }
    }
}

/// The whole source file. Its statements form the body of the implicit program function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    pub body: Vec<Node>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn folded(source: &str) -> Option<i32> {
        let source = format!("x = {}", source);
        let tokens = tokenize(&source, None).unwrap();
        let program = parse(tokens, None).unwrap();

        match &program.body[0].kind {
            NodeKind::Assign { value, .. } => value.fold(),
            other => panic!("unexpected node {:?}", other),
        }
    }

    #[test]
    fn test_fold_follows_precedence_and_ties() {
        assert_eq!(folded("10 - 3 + 2"), Some(9));
        assert_eq!(folded("20 - 5 - 3"), Some(12));
        assert_eq!(folded("7 % 4 * 3"), Some(9));
        assert_eq!(folded("2 + 3 * 4"), Some(14));
        assert_eq!(folded("1 + 1 << 2"), Some(8));
        assert_eq!(folded("1 << 4 >> 2"), Some(4));
        assert_eq!(folded("1 << 2 == 4"), Some(-1));
        assert_eq!(folded("3 < 5 && 2 > 7"), Some(0));
        assert_eq!(folded("1 > 2 || 2 > 1"), Some(-1));
        assert_eq!(folded("(0 - 7) % 3"), Some(2));
        assert_eq!(folded("1 - 1"), Some(0));
    }

    #[test]
    fn test_fold_stops_at_run_time_values() {
        assert_eq!(folded("n - 3"), None);
        assert_eq!(folded("5 % 0"), None);
        assert_eq!(folded("1 << (0 - 1)"), None);
        assert_eq!(folded("f(2) + 1"), None);
    }

    #[test]
    fn test_apply_wraps() {
        assert_eq!(BinaryOperator::Add.apply(i32::max_value(), 1), Some(i32::min_value()));
        assert_eq!(BinaryOperator::ShiftLeft.apply(1, 40), Some(0));
        assert_eq!(BinaryOperator::ShiftRight.apply(-8, 40), Some(-1));
        assert_eq!(BinaryOperator::Mod.apply(7, -3), Some(-2));
    }
}
