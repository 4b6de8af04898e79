//! Registers, flags and the ALU of the machine.
//!
//! The state of the machine can only change through [Signals](Signal). Each signal is applied
//! completely or, if it fails, not at all.

use std::collections::VecDeque;
use std::fmt;
use std::io::{Read, Write};

use crate::instruction::{AluOp, DecodeError, UnaryOp, Width};
use crate::memory::{MemoryError, MemoryManager};

/// Interface to the input and output devices.
pub trait InputOutput {
    /// Called when an `IN` interrupt is executed.
    ///
    /// # Returns
    /// The next input value, or `None` if the input has been exhausted.
    fn input(&mut self) -> Option<i32>;

    /// Called when an `OUT` interrupt is executed with the low byte of the accumulator.
    fn output(&mut self, byte: u8);
}

impl<T> InputOutput for &mut T where T: InputOutput {
    fn input(&mut self) -> Option<i32> {
        (**self).input()
    }

    fn output(&mut self, byte: u8) {
        (**self).output(byte)
    }
}

/// An IO handler for testing purposes.
///
/// Reads input values from a pre-determined input buffer and
/// appends printed values to an output buffer.
#[derive(Clone, Debug, Default)]
pub struct TestIo {
    input_buffer: VecDeque<i32>,
    output_buffer: Vec<u8>,
}

impl TestIo {
    pub fn new() -> TestIo {
        TestIo::default()
    }

    pub fn with_input<I: IntoIterator<Item=i32>>(input: I) -> TestIo {
        TestIo {
            input_buffer: input.into_iter().collect(),
            output_buffer: Vec::new(),
        }
    }

    pub fn push_input(&mut self, value: i32) {
        self.input_buffer.push_back(value);
    }

    pub fn output(&self) -> &[u8] {
        &self.output_buffer[..]
    }

    pub fn into_output(self) -> Vec<u8> {
        self.output_buffer
    }
}

impl InputOutput for TestIo {
    fn input(&mut self) -> Option<i32> {
        self.input_buffer.pop_front()
    }

    fn output(&mut self, byte: u8) {
        self.output_buffer.push(byte);
    }
}

/// An IO handler reading single bytes from the standard input and writing raw bytes to the
/// standard output. End of file or a read error exhausts the input.
pub struct StdIo;

impl InputOutput for StdIo {
    fn input(&mut self) -> Option<i32> {
        std::io::stdin()
            .bytes()
            .next()
            .transpose()
            .unwrap_or(None)
            .map(i32::from)
    }

    fn output(&mut self, byte: u8) {
        let mut stdout = std::io::stdout();

        // A closed terminal is not an error of the running program.
        let _ = stdout.write_all(&[byte]).and_then(|_| stdout.flush());
    }
}

/// Errors that stop the machine.
#[derive(Clone, Debug, PartialEq)]
pub enum MachineError {
    /// The word at `address` is not an executable instruction.
    Decode { address: i32, word: i32, reason: DecodeError },
    Memory(MemoryError),
    Arithmetic { op: AluOp, reason: &'static str },

    /// `IN` was executed with no input left.
    InputExhausted,
}

impl From<MemoryError> for MachineError {
    fn from(err: MemoryError) -> MachineError {
        MachineError::Memory(err)
    }
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineError::Decode { address, word, reason } =>
                write!(f, "cannot decode word {:#010x} at address {}: {}", word, address, reason),
            MachineError::Memory(err) => write!(f, "{}", err),
            MachineError::Arithmetic { op, reason } => write!(f, "{} failed: {}", op, reason),
            MachineError::InputExhausted => write!(f, "input exhausted"),
        }
    }
}

impl std::error::Error for MachineError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    /// Accumulator.
    pub ac: i32,
    /// Address register.
    pub ar: i32,
    /// Stack pointer. Points at the topmost used word.
    pub sp: i32,
    /// Instruction pointer.
    pub ip: i32,
    /// Data register. Holds the fetched instruction word until the operand is consumed.
    pub dr: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flags {
    pub overflow: bool,
    pub carry: bool,
    pub zero: bool,
    pub sign: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            overflow: false,
            carry: false,
            zero: true,
            sign: false,
        }
    }
}

/// Left input of the ALU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Left {
    Accumulator,
    Address,
    Zero,
}

/// Right input of the ALU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Right {
    Data,
    One,
    StackPointer,
    InstructionPointer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Binary(AluOp),
    Unary(UnaryOp),
}

/// Post-processing of the ALU result, used to convert between element counts and word counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scale {
    None,
    CeilDiv2,
    CeilDiv4,
    Mul2,
    Mul4,
}

impl Scale {
    fn apply(self, value: i64) -> i64 {
        match self {
            Scale::None => value,
            Scale::CeilDiv2 => (value + 1) >> 1,
            Scale::CeilDiv4 => (value + 3) >> 2,
            Scale::Mul2 => value << 1,
            Scale::Mul4 => value << 2,
        }
    }
}

/// A fully configured pass through the ALU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub left: Left,
    pub right: Right,
    pub function: Function,

    /// Use only the sign-extended low 16 bits of the data register, the `A` field of the
    /// fetched instruction.
    pub crop: bool,

    pub set_flags: bool,
    pub scale: Scale,
}

impl Operation {
    pub fn new(left: Left, right: Right, function: Function) -> Operation {
        Operation {
            left,
            right,
            function,
            crop: false,
            set_flags: false,
            scale: Scale::None,
        }
    }

    /// `left + right` without touching the flags.
    pub fn add(left: Left, right: Right) -> Operation {
        Operation::new(left, right, Function::Binary(AluOp::Add))
    }

    /// Passes the accumulator through unchanged.
    pub fn accumulator() -> Operation {
        Operation::new(Left::Accumulator, Right::One, Function::Binary(AluOp::Mul))
    }

    pub fn cropped(self) -> Operation {
        Operation { crop: true, ..self }
    }

    pub fn with_flags(self) -> Operation {
        Operation { set_flags: true, ..self }
    }

    pub fn scaled(self, scale: Scale) -> Operation {
        Operation { scale, ..self }
    }
}

/// Where the accumulator is latched from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    Alu(Operation),
    Input,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackStep {
    Increment,
    Decrement,
}

/// The control signals of the data path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    LatchIp(Operation),
    LatchAc(Source),
    LatchAr(Operation),
    LatchSp(StackStep),

    /// `DR := MEM[AR]`
    Read,

    /// `MEM[AR] := ALU`
    Write(Operation),

    /// `DR := MALLOC(ALU)`
    Malloc(Operation),

    /// Selects the memory addressing width for the following accesses.
    SetWidth(Width),

    /// Emits the low byte of the accumulator.
    Output,

    /// Swaps the accumulator and the data register.
    Exchange,
}

/// Computes `function(left, right)`.
///
/// Returns the 32-bit result together with the flags the operation would produce. `flags` are
/// the current flags, which supply the carry input.
pub fn alu(function: Function, left: i32, right: i32, flags: Flags, scale: Scale) -> Result<(i32, Flags), MachineError> {
    let l = left as i64;
    let r = right as i64;
    let lu = left as u32 as u64;
    let ru = right as u32 as u64;
    let carry = flags.carry as u64;

    let mut out = flags;
    let mut compared = None;
    let mut overflow = false;

    let result = match function {
        Function::Binary(op) => {
            let arithmetic = |reason| MachineError::Arithmetic { op, reason };

            match op {
                AluOp::Adc => {
                    out.carry = lu + ru + carry > 0xFFFF_FFFF;
                    l + r + carry as i64
                },
                AluOp::Add => {
                    out.carry = lu + ru > 0xFFFF_FFFF;
                    l + r
                },
                AluOp::Sbc => {
                    out.carry = lu < ru + carry;
                    l - r - carry as i64
                },
                AluOp::Sub => {
                    out.carry = lu < ru;
                    l - r
                },
                AluOp::Cmp => {
                    out.carry = lu < ru;
                    compared = Some(l - r);
                    l
                },
                AluOp::Or => l | r,
                AluOp::Xor => l ^ r,
                AluOp::And => l & r,
                AluOp::Mul => l * r,
                AluOp::Shr if r < 0 => return Err(arithmetic("negative shift")),
                AluOp::Shr => l >> r.min(32),
                AluOp::Shl if r < 0 => return Err(arithmetic("negative shift")),
                AluOp::Shl => ((lu << r.min(32)) & 0xFFFF_FFFF) as u32 as i32 as i64,
                AluOp::Mod if r == 0 => return Err(arithmetic("division by zero")),
                AluOp::Mod => {
                    let m = l % r;

                    if m != 0 && (m < 0) != (r < 0) {
                        m + r
                    } else {
                        m
                    }
                },
            }
        },
        Function::Unary(op) => match op {
            UnaryOp::Not => !l,
            UnaryOp::Neg => -l,
            UnaryOp::Rcl => {
                out.carry = lu >> 31 == 1;
                ((lu << 1 | carry) & 0xFFFF_FFFF) as u32 as i32 as i64
            },
            UnaryOp::Rcr => {
                out.carry = lu & 1 == 1;
                (lu >> 1 | carry << 31) as u32 as i32 as i64
            },
            UnaryOp::Zext8 => l & 0xFF,
            UnaryOp::Zext16 => l & 0xFFFF,
            UnaryOp::Ext8 => left as i8 as i64,
            UnaryOp::Ext16 => left as i16 as i64,
        },
    };

    let result = scale.apply(result);
    let flag_source = compared.unwrap_or(result);

    match function {
        Function::Binary(AluOp::Adc)
        | Function::Binary(AluOp::Add)
        | Function::Binary(AluOp::Sbc)
        | Function::Binary(AluOp::Sub)
        | Function::Binary(AluOp::Cmp)
        | Function::Binary(AluOp::Mul)
        | Function::Unary(UnaryOp::Neg) => {
            overflow = flag_source != flag_source as i32 as i64;
        },
        _ => (),
    }

    out.overflow = overflow;
    out.zero = flag_source as i32 == 0;
    out.sign = (flag_source as i32) < 0;

    Ok((result as i32, out))
}

/// Registers, flags, memory and devices of the machine.
pub struct DataPath<IO> {
    pub registers: Registers,
    pub flags: Flags,
    pub memory: MemoryManager,
    pub io: IO,
    output: Vec<u8>,
}

impl<IO> DataPath<IO> where IO: InputOutput {
    pub fn new(memory: MemoryManager, io: IO) -> DataPath<IO> {
        DataPath {
            registers: Registers::default(),
            flags: Flags::default(),
            memory,
            io,
            output: Vec::new(),
        }
    }

    /// Every byte emitted so far.
    pub fn output(&self) -> &[u8] {
        &self.output[..]
    }

    fn evaluate(&self, op: &Operation) -> Result<(i32, Flags), MachineError> {
        let left = match op.left {
            Left::Accumulator => self.registers.ac,
            Left::Address => self.registers.ar,
            Left::Zero => 0,
        };

        let right = match op.right {
            Right::Data if op.crop => self.registers.dr as u16 as i16 as i32,
            Right::Data => self.registers.dr,
            Right::One => 1,
            Right::StackPointer => self.registers.sp,
            Right::InstructionPointer => self.registers.ip,
        };

        alu(op.function, left, right, self.flags, op.scale)
    }

    /// Runs the ALU and commits its flags if the operation asks for it.
    fn latch(&mut self, op: &Operation) -> Result<i32, MachineError> {
        let (value, flags) = self.evaluate(op)?;

        if op.set_flags {
            self.flags = flags;
        }

        Ok(value)
    }

    /// Applies a single signal.
    pub fn signal(&mut self, signal: &Signal) -> Result<(), MachineError> {
        match signal {
            Signal::LatchIp(op) => self.registers.ip = self.latch(op)?,
            Signal::LatchAc(Source::Alu(op)) => self.registers.ac = self.latch(op)?,
            Signal::LatchAc(Source::Input) => {
                self.registers.ac = self.io.input().ok_or(MachineError::InputExhausted)?;
            },
            Signal::LatchAr(op) => self.registers.ar = self.latch(op)?,
            Signal::LatchSp(StackStep::Increment) => self.registers.sp = self.registers.sp.wrapping_add(1),
            Signal::LatchSp(StackStep::Decrement) => self.registers.sp = self.registers.sp.wrapping_sub(1),
            Signal::Read => self.registers.dr = self.memory.read(self.registers.ar)?,
            Signal::Write(op) => {
                let (value, _) = self.evaluate(op)?;
                self.memory.write(self.registers.ar, value)?;
            },
            Signal::Malloc(op) => {
                let (count, _) = self.evaluate(op)?;
                self.registers.dr = self.memory.malloc(count)?;
            },
            Signal::SetWidth(width) => self.memory.set_width(*width),
            Signal::Output => {
                let byte = self.registers.ac as u8;
                self.io.output(byte);
                self.output.push(byte);
            },
            Signal::Exchange => {
                std::mem::swap(&mut self.registers.ac, &mut self.registers.dr);
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(op: AluOp, left: i32, right: i32) -> (i32, Flags) {
        alu(Function::Binary(op), left, right, Flags::default(), Scale::None).unwrap()
    }

    fn unary(op: UnaryOp, value: i32, carry: bool) -> (i32, Flags) {
        let flags = Flags { carry, ..Flags::default() };
        alu(Function::Unary(op), value, 0, flags, Scale::None).unwrap()
    }

    #[test]
    fn test_add_flags() {
        let (value, flags) = binary(AluOp::Add, i32::max_value(), 1);
        assert_eq!(value, i32::min_value());
        assert!(flags.overflow);
        assert!(!flags.carry);
        assert!(flags.sign);
        assert!(!flags.zero);

        let (value, flags) = binary(AluOp::Add, -1, 1);
        assert_eq!(value, 0);
        assert!(flags.carry);
        assert!(!flags.overflow);
        assert!(flags.zero);
    }

    #[test]
    fn test_sub_borrow() {
        let (value, flags) = binary(AluOp::Sub, 1, 2);
        assert_eq!(value, -1);
        assert!(flags.carry);
        assert!(flags.sign);

        let (_, flags) = binary(AluOp::Sub, 3, 2);
        assert!(!flags.carry);
    }

    #[test]
    fn test_cmp_keeps_left() {
        let (value, flags) = binary(AluOp::Cmp, 7, 7);
        assert_eq!(value, 7);
        assert!(flags.zero);

        let (value, flags) = binary(AluOp::Cmp, 3, 9);
        assert_eq!(value, 3);
        assert!(flags.sign);
        assert!(!flags.zero);
    }

    #[test]
    fn test_mod_is_floored() {
        assert_eq!(binary(AluOp::Mod, 7, 3).0, 1);
        assert_eq!(binary(AluOp::Mod, -7, 3).0, 2);
        assert_eq!(binary(AluOp::Mod, 7, -3).0, -2);
        assert_eq!(
            alu(Function::Binary(AluOp::Mod), 1, 0, Flags::default(), Scale::None),
            Err(MachineError::Arithmetic { op: AluOp::Mod, reason: "division by zero" }),
        );
    }

    #[test]
    fn test_shifts() {
        assert_eq!(binary(AluOp::Shl, 1, 4).0, 16);
        assert_eq!(binary(AluOp::Shl, 1, 40).0, 0);
        assert_eq!(binary(AluOp::Shr, -16, 2).0, -4);
        assert_eq!(binary(AluOp::Shr, -16, 99).0, -1);
        assert!(alu(Function::Binary(AluOp::Shr), 1, -1, Flags::default(), Scale::None).is_err());
    }

    #[test]
    fn test_unary() {
        assert_eq!(unary(UnaryOp::Not, 0, false).0, -1);
        assert_eq!(unary(UnaryOp::Neg, 5, false).0, -5);
        assert!(unary(UnaryOp::Neg, i32::min_value(), false).1.overflow);

        let (value, flags) = unary(UnaryOp::Rcl, i32::min_value(), true);
        assert_eq!(value, 1);
        assert!(flags.carry);

        let (value, flags) = unary(UnaryOp::Rcr, 1, true);
        assert_eq!(value, i32::min_value());
        assert!(flags.carry);

        assert_eq!(unary(UnaryOp::Ext8, 0xFF, false).0, -1);
        assert_eq!(unary(UnaryOp::Ext16, 0x8000, false).0, -32768);
        assert_eq!(unary(UnaryOp::Zext8, -1, false).0, 0xFF);
        assert_eq!(unary(UnaryOp::Zext16, -1, false).0, 0xFFFF);
    }

    #[test]
    fn test_scale() {
        let scaled = |value, scale| {
            alu(Function::Binary(AluOp::Mul), value, 1, Flags::default(), scale).unwrap().0
        };

        assert_eq!(scaled(5, Scale::CeilDiv2), 3);
        assert_eq!(scaled(5, Scale::CeilDiv4), 2);
        assert_eq!(scaled(4, Scale::CeilDiv4), 1);
        assert_eq!(scaled(3, Scale::Mul2), 6);
        assert_eq!(scaled(3, Scale::Mul4), 12);
    }

    #[test]
    fn test_crop_and_flags_commit() {
        let mut path = DataPath::new(MemoryManager::new(), TestIo::new());
        path.registers.dr = 0x2000_FFFE;

        let op = Operation::add(Left::Zero, Right::Data).cropped();
        path.signal(&Signal::LatchAc(Source::Alu(op))).unwrap();
        assert_eq!(path.registers.ac, -2);
        assert_eq!(path.flags, Flags::default());

        path.signal(&Signal::LatchAc(Source::Alu(op.with_flags()))).unwrap();
        assert!(path.flags.sign);
        assert!(!path.flags.zero);
    }

    #[test]
    fn test_memory_signals() {
        let mut memory = MemoryManager::new();
        memory.malloc(4).unwrap();

        let mut path = DataPath::new(memory, TestIo::new());
        path.registers.ac = 9;
        path.registers.ar = 2;

        path.signal(&Signal::Write(Operation::accumulator())).unwrap();
        path.signal(&Signal::Read).unwrap();
        assert_eq!(path.registers.dr, 9);

        path.registers.ac = 5;
        path.signal(&Signal::Malloc(Operation::accumulator().scaled(Scale::CeilDiv4))).unwrap();
        assert_eq!(path.registers.dr, 4);
        assert_eq!(path.memory.len(), 6);

        path.signal(&Signal::Exchange).unwrap();
        assert_eq!((path.registers.ac, path.registers.dr), (4, 5));
    }

    #[test]
    fn test_input_and_output() {
        let mut path = DataPath::new(MemoryManager::new(), TestIo::with_input(vec![65]));

        path.signal(&Signal::LatchAc(Source::Input)).unwrap();
        path.signal(&Signal::Output).unwrap();
        assert_eq!(path.output(), &[65]);
        assert_eq!(path.io.output(), &[65]);

        assert_eq!(path.signal(&Signal::LatchAc(Source::Input)), Err(MachineError::InputExhausted));
        assert_eq!(path.registers.ac, 65);
    }
}
