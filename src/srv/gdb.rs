//! Debug-stub protocol (GDB remote serial protocol)
//!
//! Packets have the form `$payload#cc` where `cc` is the two-hex-digit
//! mod-256 checksum of the payload. Until `QStartNoAckMode` is negotiated,
//! every packet is answered with `+` (accepted) or `-` (checksum error)
//! before the reply packet. A 0x03 byte outside a packet is an interrupt
//! request.

use super::{DebugTarget, ServerConfig};
use crate::error::CoreError;
use crate::srv::socket::Session;
use log::debug;
use std::sync::{Arc, Mutex};

/// Compute the two-hex-digit checksum of a payload
pub fn checksum(payload: &str) -> String {
    let sum = payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
    format!("{:02x}", sum)
}

/// Verify a payload against its received checksum
pub fn verify_checksum(payload: &str, check: &str) -> bool {
    check.eq_ignore_ascii_case(&checksum(payload))
}

/// Frame a payload as a packet
pub fn packetize(payload: &str) -> String {
    format!("${}#{}", payload, checksum(payload))
}

/// The protocol engine, independent of the transport
pub struct GdbStub {
    target: Arc<Mutex<dyn DebugTarget>>,
    /// Send `+`/`-` acknowledgments until NoAckMode is negotiated
    pub ack_mode: bool,
    /// Bytes collected while a packet is in flight
    input: Vec<u8>,
}

impl GdbStub {
    pub fn new(target: Arc<Mutex<dyn DebugTarget>>) -> Self {
        Self {
            target,
            ack_mode: true,
            input: Vec::new(),
        }
    }

    /// Feed received bytes into the engine, collecting response bytes
    pub fn process_bytes(&mut self, bytes: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut output = Vec::new();

        for &byte in bytes {
            // Interrupt request outside a packet
            if self.input.is_empty() && byte == 0x03 {
                self.target.lock().unwrap().pause();
                output.extend_from_slice(packetize("S02").as_bytes());
                continue;
            }

            // Acknowledgments from the peer
            if self.input.is_empty() && (byte == b'+' || byte == b'-') {
                if byte == b'-' {
                    return Err(CoreError::UnknownCommand(Some("nack".into())));
                }
                continue;
            }

            self.input.push(byte);

            // A packet ends two bytes after the '#'
            if let Some(pos) = self.input.iter().position(|&b| b == b'#') {
                if self.input.len() >= pos + 3 {
                    let packet = std::mem::take(&mut self.input);
                    let response = self.process_packet(&packet)?;
                    output.extend_from_slice(&response);
                }
            }
        }

        Ok(output)
    }

    /// Handle one complete `$...#cc` packet
    fn process_packet(&mut self, packet: &[u8]) -> Result<Vec<u8>, CoreError> {
        let text = String::from_utf8_lossy(packet);
        let text = text.as_ref();

        if !text.starts_with('$') || text.len() < 4 {
            return Err(CoreError::InvalidFormat);
        }
        let Some(hash) = text.rfind('#') else {
            return Err(CoreError::InvalidFormat);
        };

        let payload = &text[1..hash];
        let check = &text[hash + 1..];

        let mut output = Vec::new();

        if !verify_checksum(payload, check) {
            if self.ack_mode {
                output.push(b'-');
            }
            return Err(CoreError::InvalidChecksum);
        }
        if self.ack_mode {
            output.push(b'+');
        }

        let reply = self.process_command(payload)?;
        output.extend_from_slice(packetize(&reply).as_bytes());
        Ok(output)
    }

    /// Dispatch on the command letter
    fn process_command(&mut self, payload: &str) -> Result<String, CoreError> {
        let mut chars = payload.chars();
        let Some(cmd) = chars.next() else {
            return Ok(String::new());
        };
        let arg = chars.as_str();

        debug!("gdb: '{}' '{}'", cmd, arg);

        match cmd {
            'q' => self.process_q(arg),
            'Q' => self.process_q_set(arg),
            'v' => self.process_v(arg),
            'g' => self.process_read_all_registers(),
            'p' => self.process_read_register(arg),
            'm' => self.process_read_memory(arg),
            'H' => Ok("OK".to_string()),
            'D' => {
                self.target.lock().unwrap().resume();
                Ok("OK".to_string())
            }
            '?' => Ok("S05".to_string()),
            'c' => {
                self.target.lock().unwrap().resume();
                Ok(String::new())
            }
            's' => Ok("S05".to_string()),
            'k' => Ok(String::new()),
            _ => Err(CoreError::UnsupportedCommand(Some(cmd.to_string()))),
        }
    }

    fn process_q(&mut self, arg: &str) -> Result<String, CoreError> {
        let command = arg.split(':').next().unwrap_or("");
        match command {
            "Supported" => Ok("PacketSize=512;QStartNoAckMode+;swbreak+;hwbreak+".to_string()),
            "Attached" => Ok("1".to_string()),
            "C" => Ok("QC1".to_string()),
            "fThreadInfo" => Ok("m01".to_string()),
            "sThreadInfo" => Ok("l".to_string()),
            "TStatus" => Ok("T0".to_string()),
            "Symbol" => Ok("OK".to_string()),
            "Offsets" => Ok(String::new()),
            _ => Err(CoreError::UnsupportedCommand(Some(format!("q{}", command)))),
        }
    }

    fn process_q_set(&mut self, arg: &str) -> Result<String, CoreError> {
        match arg {
            "StartNoAckMode" => {
                self.ack_mode = false;
                Ok("OK".to_string())
            }
            _ => Err(CoreError::UnsupportedCommand(Some(format!("Q{}", arg)))),
        }
    }

    fn process_v(&mut self, arg: &str) -> Result<String, CoreError> {
        if arg == "MustReplyEmpty" {
            return Ok(String::new());
        }
        if arg == "Cont?" {
            return Ok("vCont;c;C;s;S".to_string());
        }
        if arg == "Cont;c" {
            self.target.lock().unwrap().resume();
            return Ok(String::new());
        }
        Ok(String::new())
    }

    /// All 18 registers: D0..D7, A0..A7, SR, PC
    fn process_read_all_registers(&mut self) -> Result<String, CoreError> {
        let mut target = self.target.lock().unwrap();
        let mut reply = String::new();
        for nr in 0..18 {
            reply.push_str(&format!("{:08x}", target.read_register(nr)));
        }
        Ok(reply)
    }

    fn process_read_register(&mut self, arg: &str) -> Result<String, CoreError> {
        let nr = usize::from_str_radix(arg, 16).map_err(|_| CoreError::InvalidFormat)?;
        let value = self.target.lock().unwrap().read_register(nr);
        Ok(format!("{:08x}", value))
    }

    /// `m addr,len`: hex dump of guest memory
    fn process_read_memory(&mut self, arg: &str) -> Result<String, CoreError> {
        let (addr, len) = arg.split_once(',').ok_or(CoreError::InvalidFormat)?;
        let addr = u32::from_str_radix(addr, 16).map_err(|_| CoreError::InvalidFormat)?;
        let len = u32::from_str_radix(len, 16).map_err(|_| CoreError::InvalidFormat)?;

        let mut target = self.target.lock().unwrap();
        let mut reply = String::new();
        for offset in 0..len.min(512) {
            reply.push_str(&format!("{:02x}", target.read_memory(addr + offset)));
        }
        Ok(reply)
    }
}

/// Serve one client until it disconnects
pub fn serve(
    session: &mut Session,
    target: &Arc<Mutex<dyn DebugTarget>>,
    _config: &ServerConfig,
) -> Result<(), CoreError> {
    let mut stub = GdbStub::new(Arc::clone(target));

    loop {
        let bytes = session.recv()?;
        match stub.process_bytes(&bytes) {
            Ok(response) => {
                if !response.is_empty() {
                    session.send(&response)?;
                }
            }
            Err(CoreError::UnsupportedCommand(cmd)) => {
                // Unsupported commands get the empty reply
                debug!("gdb: unsupported {:?}", cmd);
                if stub.ack_mode {
                    session.send(b"+")?;
                }
                session.send_str(&packetize(""))?;
            }
            Err(err) => return Err(err),
        }
    }
}
