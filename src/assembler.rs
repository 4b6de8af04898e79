//! Assembler for the textual instruction format.
//!
//! Each non-blank line holds one instruction or data word; `#` starts a comment. The word of
//! the `n`th non-blank line is placed at address `n`.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{alpha1, alphanumeric1, char, digit1, one_of},
    combinator::{all_consuming, map, map_opt, opt, recognize},
    sequence::{delimited, preceded, tuple},
};
use slog::{debug, o, trace, Discard, Logger};

use std::fmt;
use std::result::Result as StdResult;

use crate::instruction::{AluOp, Base, Condition, Instruction, Interrupt, Operand, UnaryOp, Width};
use crate::memory::MemoryManager;

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    UnknownMnemonic(String),
    OutOfRange(i64),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::UnknownMnemonic(name) => write!(f, "unknown mnemonic '{}'", name),
            ErrorKind::OutOfRange(value) => write!(f, "value {} out of range", value),
        }
    }
}

pub type ParseError = crate::error::ParseError<ErrorKind>;
type Result<'a, T> = IResult<&'a str, T, ParseError>;

const SPACE_CHARACTERS: &str = " \t";

/// Range of values the 16-bit `A` field can be written as.
const OPERAND_RANGE: std::ops::RangeInclusive<i64> = -32768..=65535;

/// A line that could not be assembled.
#[derive(Clone, Debug)]
pub struct AssembleError {
    /// One-based line number.
    pub line: usize,
    pub text: String,
    pub error: ParseError,
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let verbose = self.error.clone().verbose(&self.text);

        write!(f, "line {} col {}: {}", self.line, verbose.column, self.error)
    }
}

impl std::error::Error for AssembleError {}

fn sp(input: &str) -> Result<&str> {
    take_while1(|c| SPACE_CHARACTERS.contains(c))(input)
}

fn sp0(input: &str) -> Result<&str> {
    take_while(|c| SPACE_CHARACTERS.contains(c))(input)
}

fn comma(input: &str) -> Result<char> {
    delimited(sp0, char(','), sp0)(input)
}

fn out_of_range<'a, T>(input: &'a str, value: i64) -> Result<'a, T> {
    Err(nom::Err::Failure(ParseError::from_kind(input.to_string(), ErrorKind::OutOfRange(value))))
}

fn take_integer(input: &str) -> Result<i64> {
    let (rest, text) = recognize(tuple((opt(one_of("+-")), digit1)))(input)?;

    match text.parse::<i64>() {
        Ok(value) => Ok((rest, value)),
        Err(_) => out_of_range(input, i64::max_value()),
    }
}

/// A value for the `A` field.
fn take_field(input: &str) -> Result<i32> {
    let (rest, value) = take_integer(input)?;

    if !OPERAND_RANGE.contains(&value) {
        return out_of_range(input, value);
    }

    Ok((rest, value as i32))
}

fn take_base(input: &str) -> Result<Base> {
    alt((
        map(tag("EAX"), |_| Base::Accumulator),
        map(tag("A"), |_| Base::Accumulator),
        map(tag("IP"), |_| Base::InstructionPointer),
        map(tag("SP"), |_| Base::StackPointer),
    ))(input)
}

/// `base`, `base+n` or `base-n`.
fn take_relative(input: &str) -> Result<Operand> {
    let (rest, base) = take_base(input)?;
    let (rest, offset) = opt(preceded(sp0, recognize(tuple((one_of("+-"), sp0, digit1)))))(rest)?;

    let offset = match offset {
        None => 0,
        Some(text) => {
            let compact = text.replace(|c| SPACE_CHARACTERS.contains(c), "");

            match compact.parse::<i64>() {
                Ok(value) if OPERAND_RANGE.contains(&value) => value as i32,
                Ok(value) => return out_of_range(rest, value),
                Err(_) => return out_of_range(rest, i64::max_value()),
            }
        },
    };

    Ok((rest, Operand::relative(base, offset)))
}

fn take_direct(input: &str) -> Result<Operand> {
    alt((
        take_relative,
        map(take_field, Operand::immediate),
    ))(input)
}

fn take_operand(input: &str) -> Result<Operand> {
    alt((
        map(delimited(char('['), delimited(sp0, take_direct, sp0), char(']')), Operand::deref),
        take_direct,
    ))(input)
}

fn take_bracketed(input: &str) -> Result<Operand> {
    delimited(char('['), delimited(sp0, take_operand, sp0), char(']'))(input)
}

fn take_width(input: &str) -> Result<Width> {
    map_opt(alpha1, Width::from_mnemonic)(input)
}

/// Optional condition followed by the jump target.
fn take_target(input: &str) -> Result<(Condition, Operand)> {
    alt((
        tuple((map_opt(alpha1, Condition::from_mnemonic), preceded(sp, take_operand))),
        map(take_operand, |operand| (Condition::Always, operand)),
    ))(input)
}

fn parse_load(input: &str) -> Result<Instruction> {
    map(
        tuple((take_width, comma, take_operand)),
        |(register, _, operand)| Instruction::Load { register, operand },
    )(input)
}

fn parse_store(input: &str) -> Result<Instruction> {
    map(
        tuple((take_bracketed, comma, take_width)),
        |(operand, _, register)| Instruction::Store { register, operand },
    )(input)
}

fn parse_alu(input: &str) -> Result<Instruction> {
    let (rest, name) = alphanumeric1(input)?;

    if let Some(op) = UnaryOp::from_mnemonic(name) {
        return Ok((rest, Instruction::Unary(op)));
    }

    let op = match AluOp::from_mnemonic(name) {
        Some(op) => op,
        None => return Err(nom::Err::Failure(ParseError::from_kind(
            input.to_string(),
            ErrorKind::UnknownMnemonic(format!("ALU {}", name)),
        ))),
    };

    preceded(sp, alt((
        map(
            tuple((take_width, comma, take_operand)),
            move |(register, _, operand)| Instruction::Alu { op, register, operand },
        ),
        map(take_operand, move |operand| Instruction::Alu { op, register: Width::Word, operand }),
    )))(rest)
}

fn parse_data(input: &str) -> Result<Instruction> {
    let (rest, value) = take_integer(input)?;

    if value < i64::from(i32::min_value()) || value > i64::from(u32::max_value()) {
        return out_of_range(input, value);
    }

    Ok((rest, Instruction::Data(value as u32 as i32)))
}

fn parse_instruction(input: &str) -> Result<Instruction> {
    let (rest, mnemonic) = alphanumeric1(input)?;

    match mnemonic {
        "NOP" => Ok((rest, Instruction::Nop)),
        "HALT" => Ok((rest, Instruction::Halt)),
        "RET" => Ok((rest, Instruction::Ret)),
        "POP" => Ok((rest, Instruction::Pop)),
        "MOV" => preceded(sp, alt((parse_load, parse_store)))(rest),
        "ALU" => preceded(sp, parse_alu)(rest),
        "INT" => preceded(sp, map(map_opt(alphanumeric1, Interrupt::from_mnemonic), Instruction::Int))(rest),
        "CALL" => preceded(sp, map(take_target, |(condition, operand)| Instruction::Call { condition, operand }))(rest),
        "JMP" => preceded(sp, map(take_target, |(condition, operand)| Instruction::Jump { condition, operand }))(rest),
        "PUSH" => preceded(sp, map(take_operand, Instruction::Push))(rest),
        "SWAP" => preceded(sp, map(take_bracketed, Instruction::Swap))(rest),
        "WORD32" => preceded(sp, parse_data)(rest),
        other => match Interrupt::from_mnemonic(other) {
            Some(code) => Ok((rest, Instruction::Int(code))),
            None => Err(nom::Err::Failure(ParseError::from_kind(
                input.to_string(),
                ErrorKind::UnknownMnemonic(other.to_string()),
            ))),
        },
    }
}

/// Parses a single line. Returns `None` for blank and comment-only lines.
pub fn parse_line(line: &str) -> StdResult<Option<Instruction>, ParseError> {
    let text = match line.find('#') {
        Some(index) => &line[..index],
        None => line,
    };

    let text = text.trim();

    if text.is_empty() {
        return Ok(None);
    }

    match all_consuming(parse_instruction)(text) {
        Ok((_, instruction)) => Ok(Some(instruction)),
        Err(nom::Err::Error(err)) | Err(nom::Err::Failure(err)) => Err(err),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::incomplete()),
    }
}

/// Assembles every line of a program.
///
/// # Errors
/// Every line that could not be assembled.
pub fn assemble<S, L>(lines: &[S], logger: L) -> StdResult<Vec<Instruction>, Vec<AssembleError>>
where
    S: AsRef<str>,
    L: Into<Option<Logger>>,
{
    let logger = logger
        .into()
        .unwrap_or(Logger::root(Discard, o!()))
        .new(o!("stage" => "assemble"));

    let mut instructions = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let line = line.as_ref();

        match parse_line(line) {
            Ok(Some(instruction)) => {
                trace!(logger, "assembled";
                    "address" => instructions.len(),
                    "instruction" => %instruction);
                instructions.push(instruction);
            },
            Ok(None) => (),
            Err(error) => {
                debug!(logger, "invalid line"; "line" => index + 1, "error" => %error);

                errors.push(AssembleError {
                    line: index + 1,
                    text: line.trim().to_string(),
                    error,
                });
            },
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    debug!(logger, "program assembled"; "words" => instructions.len());

    Ok(instructions)
}

/// Assembles a program and places it in a fresh memory starting at address 0.
pub fn load<S, L>(lines: &[S], logger: L) -> StdResult<MemoryManager, Vec<AssembleError>>
where
    S: AsRef<str>,
    L: Into<Option<Logger>>,
{
    let words = assemble(lines, logger)?
        .into_iter()
        .map(|instruction| {
            let word: u32 = instruction.into();
            word as i32
        })
        .collect();

    Ok(MemoryManager::from_words(words))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(text: &str) -> Instruction {
        parse_line(text)
            .expect("line did not parse")
            .expect("line was blank")
    }

    #[test]
    fn test_moves() {
        assert_eq!(line("MOV EAX, [SP-1]"), Instruction::Load {
            register: Width::Word,
            operand: Operand::relative(Base::StackPointer, -1).deref(),
        });

        assert_eq!(line("MOV AL,A+3"), Instruction::Load {
            register: Width::Byte,
            operand: Operand::relative(Base::Accumulator, 3),
        });

        assert_eq!(line("MOV [[SP]], AX"), Instruction::Store {
            register: Width::Half,
            operand: Operand::relative(Base::StackPointer, 0).deref(),
        });

        assert_eq!(line("MOV [2052], EAX"), Instruction::Store {
            register: Width::Word,
            operand: Operand::immediate(2052),
        });
    }

    #[test]
    fn test_alu() {
        assert_eq!(line("ALU ADD [SP]"), Instruction::Alu {
            op: AluOp::Add,
            register: Width::Word,
            operand: Operand::relative(Base::StackPointer, 0).deref(),
        });

        assert_eq!(line("ALU CMP EAX, 0"), Instruction::Alu {
            op: AluOp::Cmp,
            register: Width::Word,
            operand: Operand::immediate(0),
        });

        assert_eq!(line("ALU SUB A-2"), Instruction::Alu {
            op: AluOp::Sub,
            register: Width::Word,
            operand: Operand::relative(Base::Accumulator, -2),
        });

        assert_eq!(line("ALU EXT16"), Instruction::Unary(UnaryOp::Ext16));
    }

    #[test]
    fn test_conditions_and_bases() {
        assert_eq!(line("JMP A 5"), Instruction::Jump {
            condition: Condition::Always,
            operand: Operand::immediate(5),
        });

        assert_eq!(line("JMP A+5"), Instruction::Jump {
            condition: Condition::Always,
            operand: Operand::relative(Base::Accumulator, 5),
        });

        assert_eq!(line("CALL LE IP-12"), Instruction::Call {
            condition: Condition::LessEqual,
            operand: Operand::relative(Base::InstructionPointer, -12),
        });
    }

    #[test]
    fn test_misc() {
        assert_eq!(line("INT MALLOC16"), Instruction::Int(Interrupt::Malloc16));
        assert_eq!(line("OUT # bare interrupt"), Instruction::Int(Interrupt::Out));
        assert_eq!(line("SWAP [SP]"), Instruction::Swap(Operand::relative(Base::StackPointer, 0)));
        assert_eq!(line("PUSH -1"), Instruction::Push(Operand::immediate(-1)));
        assert_eq!(line("WORD32 4294967295"), Instruction::Data(-1));
        assert_eq!(line("  RET  "), Instruction::Ret);
        assert_eq!(parse_line("   # only a comment").unwrap(), None);
    }

    #[test]
    fn test_display_round_trip() {
        for text in &["MOV EAX, [SP-1]", "MOV [[SP]], AL", "ALU ADD EAX, [SP]", "JMP NE IP-7", "SWAP [SP]"] {
            assert_eq!(line(text).to_string(), *text);
        }
    }

    #[test]
    fn test_errors_are_collected() {
        let program = ["HALT", "FROB 1", "", "PUSH 70000", "MOV EAX, [IP+1]", "JMP %f:main:0%"];
        let errors = assemble(&program, None).unwrap_err();

        let lines = errors.iter().map(|err| err.line).collect::<Vec<_>>();
        assert_eq!(lines, vec![2, 4, 6]);
        assert!(errors[0].to_string().contains("unknown mnemonic 'FROB'"));
        assert!(errors[1].to_string().contains("out of range"));
    }

    #[test]
    fn test_load() {
        let memory = load(&["JMP 2", "WORD32 7", "HALT"], None).unwrap();

        assert_eq!(memory.words(), &[0xA000_0002u32 as i32, 7, 0x1000_0000]);
    }
}
