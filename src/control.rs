//! The control unit: fetch, decode and execute at the level of data path signals.
//!
//! Every instruction starts with the same three fetch signals:
//!
//! ```text
//! AR := 0 + IP
//! DR := MEM[AR]
//! IP := AR + 1
//! ```
//!
//! after which the word in `DR` is decoded and the signal sequence of its class is issued. Each
//! signal costs one tick, so the tick counter measures the true cost of the sequences issued.

use slog::{debug, info, o, trace, warn, Discard, Logger};

use std::convert::TryFrom;
use std::fmt;

use crate::datapath::{
    DataPath, Flags, Function, InputOutput, Left, MachineError, Operation, Right, Scale, Signal,
    Source, StackStep,
};
use crate::event::{Event, EventDispatcher, EventListener};
use crate::instruction::{Base, Condition, Instruction, Interrupt, Operand, Width};
use crate::memory::MemoryManager;

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    /// Number of instructions after which the simulation is stopped.
    pub instruction_limit: usize,
}

impl Default for SimulationConfig {
    fn default() -> SimulationConfig {
        SimulationConfig {
            instruction_limit: 1500,
        }
    }
}

/// Why a simulation ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    InstructionLimit,

    /// `IN` was executed with nothing left to read.
    InputExhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StopReason::Halted => write!(f, "halted"),
            StopReason::InstructionLimit => write!(f, "instruction limit reached"),
            StopReason::InputExhausted => write!(f, "input exhausted"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationReport {
    pub output: Vec<u8>,
    pub instructions: usize,
    pub ticks: u64,
    pub stop: StopReason,
}

/// Evaluates a jump condition against the flags.
pub fn condition_holds(condition: Condition, flags: &Flags) -> bool {
    let less = flags.sign != flags.overflow;

    match condition {
        Condition::Always => true,
        Condition::Equal => flags.zero,
        Condition::NotEqual => !flags.zero,
        Condition::Greater => !less && !flags.zero,
        Condition::Less => less,
        Condition::GreaterEqual => !less,
        Condition::LessEqual => less || flags.zero,
    }
}

/// `0 + DR`, the whole data register.
fn data() -> Operation {
    Operation::add(Left::Zero, Right::Data)
}

/// `0 + A`, the address field of the fetched instruction.
fn field() -> Operation {
    data().cropped()
}

/// Signals that leave the address selected by `operand` in `AR`.
///
/// The operand is taken as an address: `[SP+1]` selects the word at `SP+1` and a further
/// indirection reads a pointer from there first.
fn address_signals(operand: &Operand, signals: &mut Vec<Signal>) {
    match operand.base {
        Base::Immediate | Base::InstructionPointer => signals.push(Signal::LatchAr(field())),
        Base::Accumulator => {
            signals.push(Signal::LatchAr(Operation::add(Left::Accumulator, Right::Data).cropped()));
        },
        Base::StackPointer => {
            signals.push(Signal::LatchAr(Operation::add(Left::Zero, Right::StackPointer)));
            signals.push(Signal::LatchAr(Operation::add(Left::Address, Right::Data).cropped()));
        },
    }

    if operand.indirect {
        signals.push(Signal::Read);
        signals.push(Signal::LatchAr(data()));
    }
}

/// Reads the slot at `AR` into `DR` with the given width.
fn read_signals(width: Width, signals: &mut Vec<Signal>) {
    if width == Width::Word {
        signals.push(Signal::Read);
    } else {
        signals.push(Signal::SetWidth(width));
        signals.push(Signal::Read);
        signals.push(Signal::SetWidth(Width::Word));
    }
}

/// Builds the signal sequence of a decoded instruction.
///
/// Conditions are evaluated against `flags` without issuing signals. A `CALL` or `JMP` whose
/// condition does not hold has an empty sequence.
pub fn microcode(instruction: &Instruction, flags: &Flags) -> Vec<Signal> {
    use Instruction::*;

    let mut signals = Vec::with_capacity(8);

    match instruction {
        Nop | Halt | Data(_) => (),
        Load { register, operand } => match (operand.base, operand.indirect) {
            (Base::Immediate, false) => signals.push(Signal::LatchAc(Source::Alu(field()))),
            (Base::Accumulator, false) => signals.push(Signal::LatchAc(Source::Alu(
                Operation::add(Left::Accumulator, Right::Data).cropped(),
            ))),
            _ => {
                address_signals(&Operand { indirect: false, ..*operand }, &mut signals);
                read_signals(*register, &mut signals);
                signals.push(Signal::LatchAc(Source::Alu(data())));
            },
        },
        Store { register, operand } => {
            address_signals(operand, &mut signals);

            if *register == Width::Word {
                signals.push(Signal::Write(Operation::accumulator()));
            } else {
                signals.push(Signal::SetWidth(*register));
                signals.push(Signal::Write(Operation::accumulator()));
                signals.push(Signal::SetWidth(Width::Word));
            }
        },
        Alu { op, register, operand } => {
            let function = Function::Binary(*op);

            if operand.mode() == 0 {
                let operation = Operation::new(Left::Accumulator, Right::Data, function);
                signals.push(Signal::LatchAc(Source::Alu(operation.cropped().with_flags())));
            } else {
                address_signals(&Operand { indirect: false, ..*operand }, &mut signals);
                read_signals(*register, &mut signals);

                let operation = Operation::new(Left::Accumulator, Right::Data, function);
                signals.push(Signal::LatchAc(Source::Alu(operation.with_flags())));
            }
        },
        Unary(op) => {
            let operation = Operation::new(Left::Accumulator, Right::One, Function::Unary(*op));
            signals.push(Signal::LatchAc(Source::Alu(operation.with_flags())));
        },
        Int(code) => match code {
            Interrupt::Out => signals.push(Signal::Output),
            Interrupt::In => signals.push(Signal::LatchAc(Source::Input)),
            Interrupt::Malloc32 => {
                signals.push(Signal::Malloc(Operation::accumulator()));
                signals.push(Signal::LatchAc(Source::Alu(data())));
            },
            Interrupt::Malloc16 | Interrupt::Malloc8 => {
                let (words, elements) = match code {
                    Interrupt::Malloc16 => (Scale::CeilDiv2, Scale::Mul2),
                    _ => (Scale::CeilDiv4, Scale::Mul4),
                };

                signals.push(Signal::Malloc(Operation::accumulator().scaled(words)));
                signals.push(Signal::LatchAc(Source::Alu(data())));
                signals.push(Signal::LatchAc(Source::Alu(Operation::accumulator().scaled(elements))));
            },
        },
        Call { condition, operand } => {
            if condition_holds(*condition, flags) {
                signals.push(Signal::LatchSp(StackStep::Increment));
                signals.push(Signal::LatchAr(Operation::add(Left::Zero, Right::StackPointer)));
                signals.push(Signal::Write(Operation::add(Left::Zero, Right::InstructionPointer)));
                jump_signals(operand, &mut signals);
            }
        },
        Jump { condition, operand } => {
            if condition_holds(*condition, flags) {
                jump_signals(operand, &mut signals);
            }
        },
        Ret => {
            signals.push(Signal::LatchAr(Operation::add(Left::Zero, Right::StackPointer)));
            signals.push(Signal::Read);
            signals.push(Signal::LatchIp(data()));
            signals.push(Signal::LatchSp(StackStep::Decrement));
        },
        Push(operand) => {
            signals.push(Signal::LatchSp(StackStep::Increment));

            let top = Signal::LatchAr(Operation::add(Left::Zero, Right::StackPointer));

            match (operand.base, operand.indirect) {
                (Base::Accumulator, false) => {
                    signals.push(top);
                    signals.push(Signal::Write(Operation::add(Left::Accumulator, Right::Data).cropped()));
                },
                (_, false) => {
                    signals.push(top);
                    signals.push(Signal::Write(field()));
                },
                (_, true) => {
                    address_signals(&Operand { indirect: false, ..*operand }, &mut signals);
                    signals.push(Signal::Read);
                    signals.push(top);
                    signals.push(Signal::Write(data()));
                },
            }
        },
        Pop => {
            signals.push(Signal::LatchAr(Operation::add(Left::Zero, Right::StackPointer)));
            signals.push(Signal::Read);
            signals.push(Signal::LatchAc(Source::Alu(data())));
            signals.push(Signal::LatchSp(StackStep::Decrement));
        },
        Swap(operand) => {
            address_signals(operand, &mut signals);
            signals.push(Signal::Read);
            signals.push(Signal::Exchange);
            signals.push(Signal::Write(data()));
        },
    }

    signals
}

fn jump_signals(operand: &Operand, signals: &mut Vec<Signal>) {
    if operand.base == Base::InstructionPointer {
        signals.push(Signal::LatchAr(Operation::add(Left::Zero, Right::InstructionPointer)));
        signals.push(Signal::LatchIp(Operation::add(Left::Address, Right::Data).cropped()));
    } else {
        signals.push(Signal::LatchIp(field()));
    }
}

/// Drives a [DataPath] one instruction at a time.
pub struct ControlUnit<IO> {
    datapath: DataPath<IO>,
    ticks: u64,
    instructions: usize,
    halted: bool,
    dispatcher: EventDispatcher,
    logger: Logger,
}

impl<IO> ControlUnit<IO> where IO: InputOutput {
    /// Creates a control unit with all registers zeroed, so execution starts at address 0.
    pub fn new<L: Into<Option<Logger>>>(memory: MemoryManager, io: IO, logger: L) -> ControlUnit<IO> {
        let logger = logger
            .into()
            .unwrap_or(Logger::root(Discard, o!()))
            .new(o!("stage" => "simulation"));

        ControlUnit {
            datapath: DataPath::new(memory, io),
            ticks: 0,
            instructions: 0,
            halted: false,
            dispatcher: EventDispatcher::new(),
            logger,
        }
    }

    pub fn datapath(&self) -> &DataPath<IO> {
        &self.datapath
    }

    pub fn datapath_mut(&mut self) -> &mut DataPath<IO> {
        &mut self.datapath
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Number of instructions executed to completion.
    pub fn instructions(&self) -> usize {
        self.instructions
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Registers a listener that is notified of every signal, instruction and output byte.
    pub fn add_listener<L: EventListener + 'static>(&mut self, listener: L) {
        self.dispatcher.add_listener(listener);
    }

    fn issue(&mut self, signal: Signal) -> Result<(), MachineError> {
        self.ticks += 1;
        self.datapath.signal(&signal)?;

        if !self.dispatcher.is_empty() {
            self.dispatcher.dispatch(Event::Signal { signal, tick: self.ticks });

            if signal == Signal::Output {
                let byte = self.datapath.registers.ac as u8;
                self.dispatcher.dispatch(Event::Output { byte });
            }
        }

        Ok(())
    }

    /// Fetches, decodes and executes a single instruction.
    ///
    /// A word that does not decode to a legal instruction is reported before any of its signals
    /// are issued, and the registers are restored to their state before the fetch.
    pub fn step(&mut self) -> Result<(), MachineError> {
        if self.halted {
            return Ok(());
        }

        let saved = self.datapath.registers;
        let address = saved.ip;

        self.issue(Signal::LatchAr(Operation::add(Left::Zero, Right::InstructionPointer)))?;
        self.issue(Signal::Read)?;
        self.issue(Signal::LatchIp(Operation::add(Left::Address, Right::One)))?;

        let word = self.datapath.registers.dr;

        let decoded = Instruction::try_from(word as u32)
            .and_then(|instruction| instruction.validate().map(|_| instruction));

        let instruction = match decoded {
            Ok(instruction) => instruction,
            Err(reason) => {
                self.datapath.registers = saved;
                return Err(MachineError::Decode { address, word, reason });
            },
        };

        trace!(self.logger, "execute";
            "address" => address,
            "instruction" => %instruction,
            "tick" => self.ticks);

        for signal in microcode(&instruction, &self.datapath.flags) {
            self.issue(signal)?;
        }

        if instruction == Instruction::Halt {
            self.halted = true;
        }

        self.instructions += 1;

        if !self.dispatcher.is_empty() {
            self.dispatcher.dispatch(Event::Instruction { address, instruction });
        }

        Ok(())
    }

    /// Runs until the machine halts, the input runs out or the instruction limit is reached.
    pub fn run(&mut self, config: &SimulationConfig) -> Result<SimulationReport, MachineError> {
        let stop = loop {
            if self.halted {
                break StopReason::Halted;
            }

            if self.instructions >= config.instruction_limit {
                warn!(self.logger, "instruction limit reached"; "limit" => config.instruction_limit);
                break StopReason::InstructionLimit;
            }

            match self.step() {
                Ok(()) => (),
                Err(MachineError::InputExhausted) => {
                    warn!(self.logger, "input exhausted"; "address" => self.datapath.registers.ip.wrapping_sub(1));
                    break StopReason::InputExhausted;
                },
                Err(err) => {
                    debug!(self.logger, "machine error"; "error" => %err, "ticks" => self.ticks);
                    return Err(err);
                },
            }
        };

        info!(self.logger, "simulation finished";
            "stop" => %stop,
            "output" => ?self.datapath.output(),
            "instructions" => self.instructions,
            "ticks" => self.ticks);

        Ok(SimulationReport {
            output: self.datapath.output().to_vec(),
            instructions: self.instructions,
            ticks: self.ticks,
            stop,
        })
    }

    pub fn into_datapath(self) -> DataPath<IO> {
        self.datapath
    }
}

/// Runs the program in `memory` from address 0.
pub fn simulate<IO, L>(memory: MemoryManager, io: IO, config: &SimulationConfig, logger: L) -> Result<SimulationReport, MachineError>
where
    IO: InputOutput,
    L: Into<Option<Logger>>,
{
    ControlUnit::new(memory, io, logger).run(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::assembler;
    use crate::datapath::TestIo;
    use crate::instruction::DecodeError;

    fn machine(lines: &[&str], input: Vec<i32>) -> ControlUnit<TestIo> {
        let memory = assembler::load(lines, None).unwrap();
        ControlUnit::new(memory, TestIo::with_input(input), None)
    }

    #[test]
    fn test_halting_program() {
        let mut unit = machine(&[
            "JMP 3",
            "WORD32 0",
            "WORD32 0",
            "MOV EAX, 72",
            "PUSH A",
            "POP",
            "INT OUT",
            "HALT",
        ], vec![]);

        let signals = Rc::new(RefCell::new(Vec::new()));
        let recorded = signals.clone();

        unit.add_listener(move |event: &Event| {
            if let Event::Signal { tick, .. } = event {
                recorded.borrow_mut().push(*tick);
            }
        });

        let report = unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(report.output, vec![72]);
        assert_eq!(report.stop, StopReason::Halted);
        assert_eq!(report.instructions, 6);
        assert_eq!(report.ticks, 4 + 4 + 6 + 7 + 4 + 3);
        assert_eq!(*signals.borrow(), (1..=report.ticks).collect::<Vec<_>>());
        assert_eq!(unit.datapath().registers.sp, 0);
    }

    #[test]
    fn test_call_and_return() {
        let mut unit = machine(&[
            "JMP 3",
            "WORD32 0",
            "WORD32 0",
            "CALL 6",
            "INT OUT",
            "HALT",
            "MOV EAX, 9",
            "RET",
        ], vec![]);

        let report = unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(report.output, vec![9]);
        assert_eq!(report.ticks, 4 + 7 + 4 + 7 + 4 + 3);
        assert_eq!(unit.datapath().registers.sp, 0);
        assert_eq!(unit.datapath().memory.words()[1], 4);
    }

    #[test]
    fn test_illegal_mode_is_rejected_before_execution() {
        let load: u32 = Instruction::Load {
            register: Width::Word,
            operand: Operand::relative(Base::InstructionPointer, 1).deref(),
        }.into();

        let mut unit = ControlUnit::new(
            MemoryManager::from_words(vec![load as i32, 77]),
            TestIo::new(),
            None,
        );

        unit.datapath_mut().registers.ac = 5;
        let before = unit.datapath().registers;

        assert_eq!(unit.step(), Err(MachineError::Decode {
            address: 0,
            word: load as i32,
            reason: DecodeError::IllegalMode { instruction: "MOV", mode: 5 },
        }));

        assert_eq!(unit.datapath().registers, before);
        assert_eq!(unit.datapath().memory.words(), &[load as i32, 77]);
        assert_eq!(unit.instructions(), 0);
    }

    #[test]
    fn test_instruction_limit() {
        let mut unit = machine(&["JMP 0"], vec![]);
        let report = unit.run(&SimulationConfig { instruction_limit: 10 }).unwrap();

        assert_eq!(report.stop, StopReason::InstructionLimit);
        assert_eq!(report.instructions, 10);
        assert_eq!(report.ticks, 40);
    }

    #[test]
    fn test_input_exhaustion_keeps_output() {
        let mut unit = machine(&["IN", "OUT", "JMP 0"], vec![1, 2]);
        let report = unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(report.stop, StopReason::InputExhausted);
        assert_eq!(report.output, vec![1, 2]);
        assert_eq!(report.instructions, 6);
    }

    #[test]
    fn test_sub_word_access() {
        let mut unit = machine(&[
            "MOV EAX, 65",
            "MOV [21], AL",
            "MOV EAX, 0",
            "MOV AL, [21]",
            "HALT",
            "WORD32 0",
        ], vec![]);

        let report = unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(unit.datapath().registers.ac, 65);
        assert_eq!(unit.datapath().memory.words()[5], 0x0041_0000);
        assert_eq!(unit.datapath().memory.width(), Width::Word);
        assert_eq!(report.ticks, 4 + 7 + 4 + 8 + 3);
    }

    #[test]
    fn test_malloc_returns_element_addresses() {
        let mut unit = machine(&["MOV EAX, 3", "INT MALLOC8", "HALT"], vec![]);
        unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(unit.datapath().registers.ac, 12);
        assert_eq!(unit.datapath().memory.len(), 4);

        let mut unit = machine(&["MOV EAX, 3", "INT MALLOC16", "HALT"], vec![]);
        unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(unit.datapath().registers.ac, 6);
        assert_eq!(unit.datapath().memory.len(), 5);
    }

    #[test]
    fn test_swap_exchanges_with_stack() {
        let mut unit = machine(&[
            "JMP 2",
            "WORD32 0",
            "PUSH 7",
            "MOV EAX, 3",
            "SWAP [SP]",
            "HALT",
        ], vec![]);

        unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(unit.datapath().registers.ac, 7);
        assert_eq!(unit.datapath().memory.words()[1], 3);
    }

    #[test]
    fn test_conditions() {
        let flags = |zero, sign, overflow| Flags { zero, sign, overflow, carry: false };

        assert!(condition_holds(Condition::Equal, &flags(true, false, false)));
        assert!(condition_holds(Condition::Greater, &flags(false, false, false)));
        assert!(condition_holds(Condition::Greater, &flags(false, true, true)));
        assert!(!condition_holds(Condition::Greater, &flags(true, false, false)));
        assert!(condition_holds(Condition::Less, &flags(false, true, false)));
        assert!(condition_holds(Condition::LessEqual, &flags(true, false, false)));
        assert!(condition_holds(Condition::GreaterEqual, &flags(true, false, false)));
        assert!(!condition_holds(Condition::NotEqual, &flags(true, false, false)));
    }

    #[test]
    fn test_conditional_jump_skips_when_false() {
        let mut unit = machine(&[
            "MOV EAX, 1",
            "ALU CMP EAX, 2",
            "JMP E 5",
            "MOV EAX, 42",
            "HALT",
            "MOV EAX, 13",
            "HALT",
        ], vec![]);

        unit.run(&SimulationConfig::default()).unwrap();

        assert_eq!(unit.datapath().registers.ac, 42);
    }
}
