//! Terminal protocol
//!
//! Raw bytes, line buffered. The server greets with a one-line banner,
//! echoes a prompt, and forwards every received line to the in-emulator
//! command shell, sending its output back.

use super::{DebugTarget, ServerConfig};
use crate::error::CoreError;
use crate::srv::socket::Session;
use log::debug;
use std::sync::{Arc, Mutex};

const PROMPT: &str = "> ";

/// One-line welcome banner
fn welcome() -> String {
    format!(
        "{} Remote Server {}\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

/// Serve one client until it disconnects
pub fn serve(
    session: &mut Session,
    target: &Arc<Mutex<dyn DebugTarget>>,
    config: &ServerConfig,
) -> Result<(), CoreError> {
    session.send_str(&welcome())?;
    session.send_str(PROMPT)?;

    loop {
        let line = session.recv_line()?;
        if config.verbose {
            debug!("terminal: '{}'", line);
        }

        if line == "exit" || line == "quit" {
            return Ok(());
        }

        if !line.is_empty() {
            let output = target.lock().unwrap().execute_command(&line);
            session.send_str(&output)?;
        }
        session.send_str(PROMPT)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welcome_is_one_line() {
        let banner = welcome();
        assert_eq!(banner.matches('\n').count(), 1);
        assert!(banner.ends_with('\n'));
    }
}
