//! Viewer-originated events and the bounded queue that carries them to the
//! embedding application.

use crate::error::{Result, VncError};

/// Capacity of the server's event ring buffer.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

/// An event produced by a connected viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A key was pressed or released.
    Key {
        /// True if pressed, false if released.
        down: bool,
        /// X11 keysym.
        code: u32,
    },

    /// The pointer moved or a button changed state.
    Pointer {
        /// Button mask (bit 0 = left, bit 1 = middle, bit 2 = right, ...).
        button_mask: u8,
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
    },

    /// The viewer's clipboard contents changed.
    CutText {
        /// Raw clipboard bytes (lossily decoded to UTF-8 on the wire).
        text: String,
    },
}

/// Fixed-capacity FIFO ring buffer of [`Event`]s.
///
/// `add_event` fails with [`VncError::QueueFull`] once `len` reaches
/// [`EVENT_QUEUE_CAPACITY`]; the caller (a connection worker) logs and drops
/// the event rather than blocking. `poll_event` moves the oldest event out,
/// leaving its slot empty — ownership transfer is Rust's native move, no
/// explicit clear step is needed.
#[derive(Debug)]
pub struct EventQueue {
    slots: Box<[Option<Event>]>,
    head: usize,
    len: usize,
}

impl EventQueue {
    /// Creates an empty queue with capacity [`EVENT_QUEUE_CAPACITY`].
    pub fn new() -> Self {
        EventQueue {
            slots: (0..EVENT_QUEUE_CAPACITY).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes an event onto the tail of the queue.
    pub fn add_event(&mut self, event: Event) -> Result<()> {
        if self.len == self.slots.len() {
            return Err(VncError::QueueFull);
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(event);
        self.len += 1;
        Ok(())
    }

    /// Pops the oldest queued event, if any.
    pub fn poll_event(&mut self) -> Option<Event> {
        if self.len == 0 {
            return None;
        }
        let event = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        event
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
