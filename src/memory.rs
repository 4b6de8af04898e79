//! Word memory of the machine.
//!
//! Memory is a single growing array of 32-bit words. The same array can be addressed in bytes,
//! half-words or words depending on the current [Width]: an address is split into a word index
//! and a slot inside that word. Slot 0 is the most significant part of the word.

use std::fmt;

use crate::instruction::Width;

#[derive(Clone, Debug, PartialEq)]
pub enum MemoryError {
    /// The address points past the allocated words.
    InvalidAddress { address: i32 },

    /// `malloc` was asked for a non-positive number of words.
    InvalidAllocation { count: i32 },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::InvalidAddress { address } => write!(f, "invalid memory address {}", address),
            MemoryError::InvalidAllocation { count } => write!(f, "cannot allocate {} words", count),
        }
    }
}

impl std::error::Error for MemoryError {}

#[derive(Clone, Debug)]
pub struct MemoryManager {
    words: Vec<i32>,
    width: Width,
}

impl Default for MemoryManager {
    fn default() -> MemoryManager {
        MemoryManager::new()
    }
}

impl MemoryManager {
    pub fn new() -> MemoryManager {
        MemoryManager {
            words: Vec::new(),
            width: Width::Word,
        }
    }

    /// Memory initialized with `words`, addressed by whole words.
    pub fn from_words(words: Vec<i32>) -> MemoryManager {
        MemoryManager {
            words,
            width: Width::Word,
        }
    }

    /// Number of allocated words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[i32] {
        &self.words[..]
    }

    pub fn width(&self) -> Width {
        self.width
    }

    /// Selects how subsequent addresses are split into a word and a slot.
    pub fn set_width(&mut self, width: Width) {
        self.width = width;
    }

    /// Appends `count` zeroed words and returns the word index of the first one.
    pub fn malloc(&mut self, count: i32) -> Result<i32, MemoryError> {
        if count <= 0 {
            return Err(MemoryError::InvalidAllocation { count });
        }

        let base = self.words.len() as i32;
        self.words.resize(self.words.len() + count as usize, 0);

        Ok(base)
    }

    /// Returns the word index and the bit shift of the slot `address` selects.
    fn locate(&self, address: i32) -> Result<(usize, u32), MemoryError> {
        if address < 0 {
            return Err(MemoryError::InvalidAddress { address });
        }

        let divisor = self.width.divisor();
        let index = (address as u32 / divisor) as usize;
        let slot = address as u32 % divisor;

        if index >= self.words.len() {
            return Err(MemoryError::InvalidAddress { address });
        }

        let shift = match self.width {
            Width::Byte => (3 - slot) * 8,
            Width::Half => (1 - slot) * 16,
            Width::Word => 0,
        };

        Ok((index, shift))
    }

    fn mask(&self) -> u32 {
        match self.width {
            Width::Byte => 0xFF,
            Width::Half => 0xFFFF,
            Width::Word => 0xFFFF_FFFF,
        }
    }

    /// Reads the slot at `address`. Sub-word reads are zero-extended.
    pub fn read(&self, address: i32) -> Result<i32, MemoryError> {
        let (index, shift) = self.locate(address)?;
        let word = self.words[index] as u32;

        Ok(((word >> shift) & self.mask()) as i32)
    }

    /// Writes the low bits of `value` into the slot at `address`, keeping the rest of the word.
    pub fn write(&mut self, address: i32, value: i32) -> Result<(), MemoryError> {
        let (index, shift) = self.locate(address)?;
        let mask = self.mask() << shift;
        let word = self.words[index] as u32;

        self.words[index] = ((word & !mask) | ((value as u32) << shift & mask)) as i32;

        Ok(())
    }
}
