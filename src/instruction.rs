//! Types for representing machine instructions and their parts.
//!
//! Every instruction is a single 32-bit word:
//!
//! ```text
//! 31    28 27 26 25 24 23      20 19 18    16 15                   0
//! +-------+-----+-----+----------+--+--------+----------------------+
//! | class | RR  |     |   code   |  |   F    |          A           |
//! +-------+-----+-----+----------+--+--------+----------------------+
//! ```
//!
//! `RR` selects the register width of `MOV` and `ALU`, `code` is the ALU operation, unary
//! operation or jump condition, `F` selects how the operand is formed from `A`. Interrupts keep
//! their code in bits 23 to 16 instead.

use std::convert::TryFrom;
use std::fmt;

macro_rules! code_table {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $variant:ident = $code:expr, $mnemonic:expr; )* }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $variant, )*
        }

        impl $name {
            pub fn code(self) -> u32 {
                match self {
                    $( $name::$variant => $code, )*
                }
            }

            pub fn from_code(code: u32) -> Option<$name> {
                match code {
                    $( $code => Some($name::$variant), )*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( $name::$variant => $mnemonic, )*
                }
            }

            pub fn from_mnemonic(text: &str) -> Option<$name> {
                match text {
                    $( $mnemonic => Some($name::$variant), )*
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.mnemonic())
            }
        }
    };
}

code_table! {
    /// Binary operations of the ALU. The left operand is always the accumulator.
    pub enum AluOp {
        Adc = 0, "ADC";
        Add = 1, "ADD";
        Sbc = 2, "SBC";
        Sub = 3, "SUB";
        Or = 4, "OR";
        Xor = 5, "XOR";
        And = 6, "AND";
        Mul = 7, "MUL";
        Shr = 8, "SHR";
        Shl = 9, "SHL";
        Cmp = 10, "CMP";
        Mod = 11, "MOD";
    }
}

code_table! {
    /// Operations applied to the accumulator alone.
    pub enum UnaryOp {
        Not = 0, "NOT";
        Neg = 1, "NEG";
        Rcl = 2, "RCL";
        Rcr = 3, "RCR";
        Zext8 = 4, "ZEXT8";
        Zext16 = 5, "ZEXT16";
        Ext8 = 6, "EXT8";
        Ext16 = 7, "EXT16";
    }
}

code_table! {
    /// Interrupt codes. Code 5 is reserved for freeing memory and is rejected on decode.
    pub enum Interrupt {
        Out = 0, "OUT";
        In = 1, "IN";
        Malloc32 = 2, "MALLOC32";
        Malloc16 = 3, "MALLOC16";
        Malloc8 = 4, "MALLOC8";
    }
}

code_table! {
    /// Predicate of a `CALL` or `JMP`, evaluated against the flags.
    pub enum Condition {
        Always = 0, "A";
        Equal = 1, "E";
        NotEqual = 2, "NE";
        Greater = 3, "G";
        Less = 4, "L";
        GreaterEqual = 5, "GE";
        LessEqual = 6, "LE";
    }
}

code_table! {
    /// Register width of a `MOV` or `ALU` instruction.
    pub enum Width {
        Byte = 0, "AL";
        Half = 1, "AX";
        Word = 2, "EAX";
    }
}

impl Width {
    /// Memory addressing divisor used for accesses of this width.
    pub fn divisor(self) -> u32 {
        match self {
            Width::Byte => 4,
            Width::Half => 2,
            Width::Word => 1,
        }
    }

    /// Width of an element of `bytes` bytes.
    pub fn from_size(bytes: u32) -> Option<Width> {
        match bytes {
            1 => Some(Width::Byte),
            2 => Some(Width::Half),
            4 => Some(Width::Word),
            _ => None,
        }
    }
}

/// What the offset of an [Operand] is added to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Base {
    Immediate,
    Accumulator,
    InstructionPointer,
    StackPointer,
}

impl Base {
    fn index(self) -> u32 {
        match self {
            Base::Immediate => 0,
            Base::Accumulator => 1,
            Base::InstructionPointer => 2,
            Base::StackPointer => 3,
        }
    }

    fn from_index(index: u32) -> Base {
        match index & 0b11 {
            0 => Base::Immediate,
            1 => Base::Accumulator,
            2 => Base::InstructionPointer,
            _ => Base::StackPointer,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Base::Immediate => "",
            Base::Accumulator => "A",
            Base::InstructionPointer => "IP",
            Base::StackPointer => "SP",
        }
    }
}

/// An operand as selected by the `F` field: a base, a 16-bit offset and an optional memory
/// indirection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Operand {
    pub base: Base,
    pub offset: i32,
    pub indirect: bool,
}

impl Operand {
    pub fn immediate(value: i32) -> Operand {
        Operand { base: Base::Immediate, offset: value, indirect: false }
    }

    pub fn memory(address: i32) -> Operand {
        Operand { base: Base::Immediate, offset: address, indirect: true }
    }

    pub fn relative(base: Base, offset: i32) -> Operand {
        Operand { base, offset, indirect: false }
    }

    /// The same operand with one level of memory indirection added.
    pub fn deref(self) -> Operand {
        Operand { indirect: true, ..self }
    }

    /// Value of the `F` field.
    pub fn mode(&self) -> u32 {
        self.base.index() * 2 + self.indirect as u32
    }

    fn decode(mode: u32, field: u32) -> Operand {
        Operand {
            base: Base::from_index(mode >> 1),
            offset: field as u16 as i16 as i32,
            indirect: mode & 1 == 1,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = match (self.base, self.offset) {
            (Base::Immediate, offset) => offset.to_string(),
            (base, 0) => base.name().to_string(),
            (base, offset) if offset < 0 => format!("{}{}", base.name(), offset),
            (base, offset) => format!("{}+{}", base.name(), offset),
        };

        if self.indirect {
            write!(f, "[{}]", inner)
        } else {
            write!(f, "{}", inner)
        }
    }
}

/// A machine instruction.
///
/// Generic over the operand and register types so that the code generator can carry
/// unresolved operands in the same shape. The defaults describe a concrete instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction<O = Operand, R = Width> {
    Nop,
    Halt,

    /// `MOV R, operand`
    Load { register: R, operand: O },

    /// `MOV [operand], R`. The operand is the address, so `[SP]` stores at `SP`.
    Store { register: R, operand: O },

    /// `ALU op R, operand`
    Alu { op: AluOp, register: R, operand: O },

    /// `ALU op`
    Unary(UnaryOp),

    /// `INT name`
    Int(Interrupt),

    Call { condition: Condition, operand: O },
    Ret,
    Jump { condition: Condition, operand: O },
    Push(O),
    Pop,

    /// `SWAP [operand]`. Exchanges the accumulator with the word at the operand address.
    Swap(O),

    /// `WORD32 n`, a raw data word.
    Data(i32),
}

impl<O, R> Instruction<O, R> {
    /// Converts the operands and registers, failing on the first conversion error.
    pub fn try_map<O2, R2, E, F, G>(self, mut operand: F, mut register: G) -> Result<Instruction<O2, R2>, E>
    where
        F: FnMut(O) -> Result<O2, E>,
        G: FnMut(R) -> Result<R2, E>,
    {
        use Instruction::*;

        Ok(match self {
            Nop => Nop,
            Halt => Halt,
            Load { register: r, operand: o } => Load { register: register(r)?, operand: operand(o)? },
            Store { register: r, operand: o } => Store { register: register(r)?, operand: operand(o)? },
            Alu { op, register: r, operand: o } => Alu { op, register: register(r)?, operand: operand(o)? },
            Unary(op) => Unary(op),
            Int(code) => Int(code),
            Call { condition, operand: o } => Call { condition, operand: operand(o)? },
            Ret => Ret,
            Jump { condition, operand: o } => Jump { condition, operand: operand(o)? },
            Push(o) => Push(operand(o)?),
            Pop => Pop,
            Swap(o) => Swap(operand(o)?),
            Data(value) => Data(value),
        })
    }

    /// Change of the stack pointer caused by executing the instruction in place.
    ///
    /// `CALL` and `RET` are balanced from the point of view of the caller.
    pub fn stack_effect(&self) -> isize {
        match self {
            Instruction::Push(_) => 1,
            Instruction::Pop => -1,
            _ => 0,
        }
    }

    pub fn operand(&self) -> Option<&O> {
        use Instruction::*;

        match self {
            Load { operand, .. }
            | Store { operand, .. }
            | Alu { operand, .. }
            | Call { operand, .. }
            | Jump { operand, .. }
            | Push(operand)
            | Swap(operand) => Some(operand),
            _ => None,
        }
    }
}

impl<O: fmt::Display, R: fmt::Display> fmt::Display for Instruction<O, R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Instruction::*;

        match self {
            Nop => write!(f, "NOP"),
            Halt => write!(f, "HALT"),
            Load { register, operand } => write!(f, "MOV {}, {}", register, operand),
            Store { register, operand } => write!(f, "MOV [{}], {}", operand, register),
            Alu { op, register, operand } => write!(f, "ALU {} {}, {}", op, register, operand),
            Unary(op) => write!(f, "ALU {}", op),
            Int(code) => write!(f, "INT {}", code),
            Call { condition: Condition::Always, operand } => write!(f, "CALL {}", operand),
            Call { condition, operand } => write!(f, "CALL {} {}", condition, operand),
            Ret => write!(f, "RET"),
            Jump { condition: Condition::Always, operand } => write!(f, "JMP {}", operand),
            Jump { condition, operand } => write!(f, "JMP {} {}", condition, operand),
            Push(operand) => write!(f, "PUSH {}", operand),
            Pop => write!(f, "POP"),
            Swap(operand) => write!(f, "SWAP [{}]", operand),
            Data(value) => write!(f, "WORD32 {}", value),
        }
    }
}

const CLASS_NOP: u32 = 0;
const CLASS_HALT: u32 = 1;
const CLASS_LOAD: u32 = 2;
const CLASS_STORE: u32 = 3;
const CLASS_ALU: u32 = 4;
const CLASS_UNARY: u32 = 5;
const CLASS_INT: u32 = 6;
const CLASS_CALL: u32 = 8;
const CLASS_RET: u32 = 9;
const CLASS_JUMP: u32 = 10;
const CLASS_PUSH: u32 = 11;
const CLASS_POP: u32 = 12;
const CLASS_SWAP: u32 = 13;

fn word(class: u32, width: u32, code: u32, operand: Option<&Operand>) -> u32 {
    let (mode, field) = match operand {
        Some(operand) => (operand.mode(), operand.offset as u32 & 0xFFFF),
        None => (0, 0),
    };

    class << 28 | width << 26 | code << 20 | mode << 16 | field
}

impl Into<u32> for Instruction {
    fn into(self) -> u32 {
        use Instruction::*;

        match self {
            Nop => word(CLASS_NOP, 0, 0, None),
            Halt => word(CLASS_HALT, 0, 0, None),
            Load { register, operand } => word(CLASS_LOAD, register.code(), 0, Some(&operand)),
            Store { register, operand } => word(CLASS_STORE, register.code(), 0, Some(&operand)),
            Alu { op, register, operand } => word(CLASS_ALU, register.code(), op.code(), Some(&operand)),
            Unary(op) => word(CLASS_UNARY, 0, op.code(), None),
            Int(code) => CLASS_INT << 28 | code.code() << 16,
            Call { condition, operand } => word(CLASS_CALL, 0, condition.code(), Some(&operand)),
            Ret => word(CLASS_RET, 0, 0, None),
            Jump { condition, operand } => word(CLASS_JUMP, 0, condition.code(), Some(&operand)),
            Push(operand) => word(CLASS_PUSH, 0, 0, Some(&operand)),
            Pop => word(CLASS_POP, 0, 0, None),
            Swap(operand) => word(CLASS_SWAP, 0, 0, Some(&operand)),
            Data(value) => value as u32,
        }
    }
}

/// Reasons a word cannot be executed as an instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeError {
    ReservedClass(u32),
    ReservedWidth,
    UnknownAluOp(u32),
    UnknownUnaryOp(u32),
    ReservedInterrupt(u32),
    UnknownCondition(u32),

    /// The `F` field selects an addressing form the instruction does not support.
    IllegalMode { instruction: &'static str, mode: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::ReservedClass(class) => write!(f, "reserved instruction class {}", class),
            DecodeError::ReservedWidth => write!(f, "reserved register width"),
            DecodeError::UnknownAluOp(code) => write!(f, "unknown ALU operation {}", code),
            DecodeError::UnknownUnaryOp(code) => write!(f, "unknown unary operation {}", code),
            DecodeError::ReservedInterrupt(code) => write!(f, "reserved interrupt {}", code),
            DecodeError::UnknownCondition(code) => write!(f, "unknown condition {}", code),
            DecodeError::IllegalMode { instruction, mode } =>
                write!(f, "addressing mode {} is not allowed for {}", mode, instruction),
        }
    }
}

impl std::error::Error for DecodeError {}

impl TryFrom<u32> for Instruction {
    type Error = DecodeError;

    /// Splits a word into its fields. Whether the addressing form is legal for the instruction
    /// is checked separately by [Instruction::validate].
    fn try_from(value: u32) -> Result<Instruction, DecodeError> {
        use Instruction::*;

        let class = value >> 28;
        let width = (value >> 26) & 0b11;
        let code = (value >> 20) & 0xF;
        let operand = Operand::decode((value >> 16) & 0b111, value & 0xFFFF);

        let register = || Width::from_code(width).ok_or(DecodeError::ReservedWidth);
        let condition = || Condition::from_code(code).ok_or(DecodeError::UnknownCondition(code));

        Ok(match class {
            CLASS_NOP => Nop,
            CLASS_HALT => Halt,
            CLASS_LOAD => Load { register: register()?, operand },
            CLASS_STORE => Store { register: register()?, operand },
            CLASS_ALU => Alu {
                op: AluOp::from_code(code).ok_or(DecodeError::UnknownAluOp(code))?,
                register: register()?,
                operand,
            },
            CLASS_UNARY => Unary(UnaryOp::from_code(code).ok_or(DecodeError::UnknownUnaryOp(code))?),
            CLASS_INT => {
                let code = (value >> 16) & 0xFF;
                Int(Interrupt::from_code(code).ok_or(DecodeError::ReservedInterrupt(code))?)
            },
            CLASS_CALL => Call { condition: condition()?, operand },
            CLASS_RET => Ret,
            CLASS_JUMP => Jump { condition: condition()?, operand },
            CLASS_PUSH => Push(operand),
            CLASS_POP => Pop,
            CLASS_SWAP => Swap(operand),
            class => return Err(DecodeError::ReservedClass(class)),
        })
    }
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        use Instruction::*;

        match self {
            Nop => "NOP",
            Halt => "HALT",
            Load { .. } | Store { .. } => "MOV",
            Alu { .. } | Unary(_) => "ALU",
            Int(_) => "INT",
            Call { .. } => "CALL",
            Ret => "RET",
            Jump { .. } => "JMP",
            Push(_) => "PUSH",
            Pop => "POP",
            Swap(_) => "SWAP",
            Data(_) => "WORD32",
        }
    }

    /// Checks that the addressing form is one the control unit implements for this
    /// instruction.
    ///
    /// Memory-at-SP loads and ALU operations read a whole word and therefore require `EAX`.
    pub fn validate(&self) -> Result<(), DecodeError> {
        use Instruction::*;

        let (allowed, mode): (&[u32], u32) = match self {
            Load { register, operand } => match (operand.mode(), register) {
                (7, Width::Word) => return Ok(()),
                (mode, _) => (&[0, 1, 2, 3][..], mode),
            },
            Store { operand, .. } => (&[0, 1, 2, 3, 6, 7][..], operand.mode()),
            Alu { register, operand, .. } => match (operand.mode(), register) {
                (7, Width::Word) => return Ok(()),
                (mode, _) => (&[0, 1, 3][..], mode),
            },
            Call { operand, .. } | Jump { operand, .. } => (&[0, 4][..], operand.mode()),
            Push(operand) => (&[0, 1, 2, 3][..], operand.mode()),
            Swap(operand) => (&[6][..], operand.mode()),
            _ => return Ok(()),
        };

        if allowed.contains(&mode) {
            Ok(())
        } else {
            Err(DecodeError::IllegalMode { instruction: self.name(), mode })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(instruction: Instruction) -> u32 {
        instruction.into()
    }

    #[test]
    fn test_encoding() {
        assert_eq!(encode(Instruction::Halt), 0x1000_0000);

        assert_eq!(
            encode(Instruction::Load {
                register: Width::Word,
                operand: Operand::relative(Base::StackPointer, -1).deref(),
            }),
            0x2807_FFFF,
        );

        assert_eq!(
            encode(Instruction::Store {
                register: Width::Byte,
                operand: Operand::immediate(10),
            }),
            0x3000_000A,
        );

        assert_eq!(
            encode(Instruction::Alu {
                op: AluOp::Cmp,
                register: Width::Word,
                operand: Operand::relative(Base::StackPointer, 0).deref(),
            }),
            0x48A7_0000,
        );

        assert_eq!(encode(Instruction::Int(Interrupt::Malloc8)), 0x6004_0000);
        assert_eq!(encode(Instruction::Unary(UnaryOp::Ext8)), 0x5060_0000);

        assert_eq!(
            encode(Instruction::Jump {
                condition: Condition::NotEqual,
                operand: Operand::relative(Base::InstructionPointer, -7),
            }),
            0xA024_FFF9,
        );

        assert_eq!(encode(Instruction::Data(-2)), 0xFFFF_FFFE);
    }

    #[test]
    fn test_decoding() {
        let decoded = Instruction::try_from(0x2807_FFFF).unwrap();

        assert_eq!(decoded, Instruction::Load {
            register: Width::Word,
            operand: Operand::relative(Base::StackPointer, -1).deref(),
        });

        assert_eq!(
            Instruction::try_from(0xA024_FFF9).unwrap(),
            Instruction::Jump {
                condition: Condition::NotEqual,
                operand: Operand::relative(Base::InstructionPointer, -7),
            },
        );

        assert_eq!(Instruction::try_from(0x6001_0000).unwrap(), Instruction::Int(Interrupt::In));
    }

    #[test]
    fn test_reserved_encodings() {
        assert_eq!(Instruction::try_from(0x7000_0000), Err(DecodeError::ReservedClass(7)));
        assert_eq!(Instruction::try_from(0xE000_0000), Err(DecodeError::ReservedClass(14)));
        assert_eq!(Instruction::try_from(0x2C00_0000), Err(DecodeError::ReservedWidth));
        assert_eq!(Instruction::try_from(0x6005_0000), Err(DecodeError::ReservedInterrupt(5)));
        assert_eq!(Instruction::try_from(0x40C0_0000), Err(DecodeError::UnknownAluOp(12)));
        assert_eq!(Instruction::try_from(0x8070_0000), Err(DecodeError::UnknownCondition(7)));
    }

    #[test]
    fn test_validate() {
        let load = |register, operand| Instruction::Load { register, operand };
        let ip = |offset| Operand::relative(Base::InstructionPointer, offset);
        let sp = |offset| Operand::relative(Base::StackPointer, offset);

        assert!(load(Width::Word, sp(-2).deref()).validate().is_ok());
        assert!(load(Width::Byte, sp(-2).deref()).validate().is_err());
        assert!(load(Width::Word, ip(2).deref()).validate().is_err());
        assert_eq!(
            Instruction::Push(ip(1).deref()).validate(),
            Err(DecodeError::IllegalMode { instruction: "PUSH", mode: 5 }),
        );
        assert!(Instruction::Jump { condition: Condition::Always, operand: ip(3) }.validate().is_ok());
        assert!(Instruction::Swap(sp(0)).validate().is_ok());
        assert!(Instruction::Swap(Operand::memory(0)).validate().is_err());
    }

    #[test]
    fn test_display() {
        let sp = |offset| Operand::relative(Base::StackPointer, offset);

        let lines = vec![
            Instruction::Load { register: Width::Word, operand: sp(-1).deref() },
            Instruction::Store { register: Width::Word, operand: sp(-3) },
            Instruction::Store { register: Width::Byte, operand: sp(0).deref() },
            Instruction::Alu { op: AluOp::Add, register: Width::Word, operand: sp(0).deref() },
            Instruction::Unary(UnaryOp::Not),
            Instruction::Int(Interrupt::Out),
            Instruction::Jump { condition: Condition::NotEqual, operand: Operand::relative(Base::InstructionPointer, -7) },
            Instruction::Call { condition: Condition::Always, operand: Operand::immediate(40) },
            Instruction::Load { register: Width::Half, operand: Operand::relative(Base::Accumulator, 3).deref() },
            Instruction::Push(Operand::memory(5)),
            Instruction::Swap(sp(0)),
            Instruction::Data(70000),
        ];

        let text = lines.iter().map(ToString::to_string).collect::<Vec<_>>();

        assert_eq!(text, vec![
            "MOV EAX, [SP-1]",
            "MOV [SP-3], EAX",
            "MOV [[SP]], AL",
            "ALU ADD EAX, [SP]",
            "ALU NOT",
            "INT OUT",
            "JMP NE IP-7",
            "CALL 40",
            "MOV AX, [A+3]",
            "PUSH [5]",
            "SWAP [SP]",
            "WORD32 70000",
        ]);
    }

    #[test]
    fn test_stack_effect() {
        assert_eq!(Instruction::<Operand, Width>::Push(Operand::immediate(0)).stack_effect(), 1);
        assert_eq!(Instruction::<Operand, Width>::Pop.stack_effect(), -1);
        assert_eq!(Instruction::<Operand, Width>::Ret.stack_effect(), 0);
    }
}
