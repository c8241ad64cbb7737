//! Message queue
//!
//! Components report observable state changes (drive LEDs, disk changes,
//! halts) by posting messages. The queue is a bounded ring protected by a
//! mutex: the emulator thread is the single producer, the embedding UI the
//! single consumer. If a listener callback is registered, messages bypass
//! the ring and are delivered immediately.

use log::warn;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Capacity of the message ring
const CAPACITY: usize = 512;

/// Notifications posted by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    PowerOn,
    PowerOff,
    PowerLedOn,
    PowerLedDim,
    PowerLedOff,
    /// The memory bank tables were rebuilt
    MemLayout,
    /// The CPU overclocking factor changed
    Overclocking(usize),
    DriveConnect { drive: usize, connected: bool },
    /// The selected drive changed (-1 = none)
    DriveSelect(i8),
    DriveLed { drive: usize, on: bool },
    DriveMotor { drive: usize, on: bool },
    DriveStep { drive: usize, cylinder: u8 },
    /// A step that is part of a disk-polling loop
    DrivePoll { drive: usize, cylinder: u8 },
    DriveRead { drive: usize },
    DriveWrite { drive: usize },
    DiskInsert { drive: usize },
    DiskEject { drive: usize },
    DiskProtected { drive: usize, protected: bool },
    SerIn(u16),
    SerOut(u16),
    /// A remote server switched state
    SrvState(u8),
    SnapshotTaken,
    /// The emulator halted on an internal inconsistency
    CpuHalt,
}

type Listener = Box<dyn FnMut(Msg) + Send>;

struct Inner {
    queue: VecDeque<Msg>,
    listener: Option<Listener>,
    enabled: bool,
}

/// Mutex-protected message ring with an optional listener
pub struct MsgQueue {
    inner: Mutex<Inner>,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(CAPACITY),
                listener: None,
                enabled: true,
            }),
        }
    }

    /// Register a listener and flush all pending messages to it
    pub fn set_listener<F>(&self, mut listener: F)
    where
        F: FnMut(Msg) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        while let Some(msg) = inner.queue.pop_front() {
            listener(msg);
        }
        inner.listener = Some(Box::new(listener));
    }

    /// Post a message
    pub fn put(&self, msg: Msg) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enabled {
            return;
        }
        if let Some(listener) = inner.listener.as_mut() {
            listener(msg);
            return;
        }
        if inner.queue.len() < CAPACITY {
            inner.queue.push_back(msg);
        } else {
            warn!("message lost: {:?}", msg);
        }
    }

    /// Pop the oldest pending message
    pub fn get(&self) -> Option<Msg> {
        self.inner.lock().unwrap().queue.pop_front()
    }

    /// Suppress or re-enable message delivery
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.lock().unwrap().enabled = enabled;
    }

    /// Number of messages waiting in the ring
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MsgQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MsgQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgQueue").field("len", &self.len()).finish()
    }
}
