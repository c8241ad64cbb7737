//! Remote observer/control servers
//!
//! A single TCP port speaks one of two protocols: a line-buffered terminal
//! with an in-emulator command shell, or the GDB remote serial protocol.
//! The server runs on its own thread; the emulator thread is never blocked.
//! Commands reach the core through the `DebugTarget` trait behind a mutex,
//! so the observer reads while the emulator writes.

pub mod gdb;
pub mod socket;
pub mod terminal;

use crate::config::ServerProtocol;
use crate::error::CoreError;
use log::{debug, warn};
use socket::{PortListener, SessionCloser};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// What a connected observer may do with the core
pub trait DebugTarget: Send {
    /// Data registers 0..7, address registers 8..15, SR = 16, PC = 17
    fn read_register(&mut self, nr: usize) -> u32;
    /// Side-effect-free memory read
    fn read_memory(&mut self, addr: u32) -> u8;
    /// Resume the emulator
    fn resume(&mut self);
    /// Stop the emulator between instructions
    fn pause(&mut self);
    /// Execute a shell command and return its output
    fn execute_command(&mut self, command: &str) -> String;
}

/// Server lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SrvState {
    Off = 0,
    Starting = 1,
    Listening = 2,
    Connected = 3,
    Stopping = 4,
    Error = 5,
}

impl SrvState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SrvState::Starting,
            2 => SrvState::Listening,
            3 => SrvState::Connected,
            4 => SrvState::Stopping,
            5 => SrvState::Error,
            _ => SrvState::Off,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub protocol: ServerProtocol,
    pub verbose: bool,
    pub auto_run: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            protocol: ServerProtocol::Terminal,
            verbose: false,
            auto_run: false,
        }
    }
}

/// A remote server and its worker thread
pub struct RemoteServer {
    pub config: ServerConfig,
    state: Arc<AtomicU8>,
    stop_requested: Arc<AtomicBool>,
    session_closer: Arc<Mutex<Option<SessionCloser>>>,
    thread: Option<JoinHandle<()>>,
    /// The port the listener actually bound (port 0 picks a free one)
    bound_port: Arc<AtomicPort>,
}

/// The bound port number exchanged between threads
struct AtomicPort(std::sync::atomic::AtomicU16);

use std::sync::atomic::AtomicU16;

impl AtomicPort {
    fn new() -> Self {
        Self(AtomicU16::new(0))
    }
    fn store(&self, value: u16) {
        self.0.store(value, Ordering::SeqCst);
    }
    fn load(&self) -> u16 {
        self.0.load(Ordering::SeqCst)
    }
}

impl RemoteServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(SrvState::Off as u8)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            session_closer: Arc::new(Mutex::new(None)),
            thread: None,
            bound_port: Arc::new(AtomicPort::new()),
        }
    }

    pub fn state(&self) -> SrvState {
        SrvState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_off(&self) -> bool {
        self.state() == SrvState::Off
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SrvState::Connected
    }

    /// The port the server is listening on
    pub fn bound_port(&self) -> u16 {
        self.bound_port.load()
    }

    /// Launch the server thread
    pub fn start(&mut self, target: Arc<Mutex<dyn DebugTarget>>) -> Result<(), CoreError> {
        if !self.is_off() {
            return Err(CoreError::ServerRunning);
        }

        debug!("starting remote server on port {}", self.config.port);
        self.state.store(SrvState::Starting as u8, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let stop = Arc::clone(&self.stop_requested);
        let closer = Arc::clone(&self.session_closer);
        let bound = Arc::clone(&self.bound_port);

        self.thread = Some(std::thread::spawn(move || {
            if let Err(err) = Self::main(config, state.clone(), stop, closer, bound, target) {
                warn!("remote server error: {}", err);
                state.store(SrvState::Error as u8, Ordering::SeqCst);
            }
        }));

        Ok(())
    }

    /// Shut the server down, interrupting any blocked accept or receive
    pub fn stop(&mut self) -> Result<(), CoreError> {
        if self.is_off() {
            return Err(CoreError::ServerNotRunning);
        }

        debug!("stopping remote server");
        self.state.store(SrvState::Stopping as u8, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);

        // Close the live session, if any
        self.disconnect_inner();

        // Unblock a pending accept. If the worker has not bound the
        // listener yet, give it a moment to get there.
        let mut attempts = 0;
        while self.bound_port() == 0 && attempts < 100 {
            std::thread::sleep(std::time::Duration::from_millis(5));
            attempts += 1;
        }
        PortListener::interrupt(self.bound_port());

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }

        self.state.store(SrvState::Off as u8, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the current client but keep listening
    pub fn disconnect(&mut self) -> Result<(), CoreError> {
        if self.is_off() {
            return Err(CoreError::ServerNotRunning);
        }
        self.disconnect_inner();
        Ok(())
    }

    fn disconnect_inner(&self) {
        if let Some(closer) = self.session_closer.lock().unwrap().take() {
            closer.close();
        }
    }

    /// The worker thread: accept one client at a time and serve it
    fn main(
        config: ServerConfig,
        state: Arc<AtomicU8>,
        stop: Arc<AtomicBool>,
        closer: Arc<Mutex<Option<SessionCloser>>>,
        bound: Arc<AtomicPort>,
        target: Arc<Mutex<dyn DebugTarget>>,
    ) -> Result<(), CoreError> {
        let listener = PortListener::bind(config.port)?;
        bound.store(listener.port());

        loop {
            state.store(SrvState::Listening as u8, Ordering::SeqCst);

            let mut session = listener.accept()?;
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            state.store(SrvState::Connected as u8, Ordering::SeqCst);
            *closer.lock().unwrap() = Some(session.close_handle()?);

            let outcome = match config.protocol {
                ServerProtocol::Terminal => {
                    terminal::serve(&mut session, &target, &config)
                }
                ServerProtocol::GdbStub => gdb::serve(&mut session, &target, &config),
            };

            closer.lock().unwrap().take();
            session.close();

            match outcome {
                Ok(()) | Err(CoreError::ServerDisconnected) => {
                    debug!("client disconnected");
                }
                Err(err) => return Err(err),
            }

            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        if !self.is_off() {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServer")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_target {
    use super::DebugTarget;

    /// A scripted target for protocol tests
    pub struct MockTarget {
        pub registers: [u32; 18],
        pub memory: Vec<u8>,
        pub running: bool,
        pub commands: Vec<String>,
    }

    impl MockTarget {
        pub fn new() -> Self {
            Self {
                registers: [0; 18],
                memory: vec![0; 0x1000],
                running: false,
                commands: Vec::new(),
            }
        }
    }

    impl DebugTarget for MockTarget {
        fn read_register(&mut self, nr: usize) -> u32 {
            self.registers.get(nr).copied().unwrap_or(0)
        }

        fn read_memory(&mut self, addr: u32) -> u8 {
            self.memory.get(addr as usize).copied().unwrap_or(0xFF)
        }

        fn resume(&mut self) {
            self.running = true;
        }

        fn pause(&mut self) {
            self.running = false;
        }

        fn execute_command(&mut self, command: &str) -> String {
            self.commands.push(command.to_string());
            format!("ok: {}\n", command)
        }
    }
}
