//! Event handling.
//!
//! The control unit exposes an event-based interface for observing the machine while it runs.
//! [EventListeners](EventListener) can be registered on the
//! [ControlUnit](crate::control::ControlUnit) with the
//! [add_listener](crate::control::ControlUnit::add_listener) method.
//!
//! A blanket implementation of [EventListener] for all `FnMut(&Event)` is provided.

use crate::datapath::Signal;
use crate::instruction::Instruction;

/// Represents an event that occurred while executing a program.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A signal was issued to the data path.
    Signal {
        signal: Signal,

        /// Tick count after the signal, starting from 1 for the first signal of a run.
        tick: u64,
    },

    /// An instruction finished executing.
    Instruction {
        /// Address the instruction was fetched from.
        address: i32,
        instruction: Instruction,
    },

    /// The program emitted a byte.
    Output {
        byte: u8,
    },
}

/// Trait for consuming events.
pub trait EventListener {
    /// Called whenever a new event has been created.
    fn event(&mut self, event: &Event);
}

impl<F> EventListener for F where F: FnMut(&Event) {
    fn event(&mut self, event: &Event) {
        self(event)
    }
}

#[derive(Default)]
pub(crate) struct EventDispatcher {
    listeners: Vec<Box<dyn EventListener>>,
}

impl EventDispatcher {
    pub fn new() -> EventDispatcher {
        EventDispatcher {
            listeners: Vec::new(),
        }
    }

    pub fn add_listener<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Box::new(listener) as Box<dyn EventListener>)
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn dispatch(&mut self, event: Event) {
        for listener in &mut self.listeners {
            listener.event(&event);
        }
    }
}
