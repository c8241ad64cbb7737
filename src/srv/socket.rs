//! TCP plumbing for the remote servers
//!
//! A listener owns a port and produces sessions; a session owns a
//! bidirectional byte stream with delivery order and a clean-close signal.
//! Both sides support asynchronous shutdown: another thread may close the
//! underlying socket, which makes a blocked accept or receive fail with a
//! disconnect error instead of hanging.

use crate::error::CoreError;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};

/// Receive buffer size per read
const BUFFER_SIZE: usize = 512;

/// A connected byte stream
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// A handle another thread can use to shut the session down
    pub fn close_handle(&self) -> Result<SessionCloser, CoreError> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|e| CoreError::SocketError(e.to_string()))?;
        Ok(SessionCloser { stream })
    }

    /// Receive a chunk of bytes. A clean close by the peer yields
    /// `ServerDisconnected`.
    pub fn recv(&mut self) -> Result<Vec<u8>, CoreError> {
        let mut buffer = [0u8; BUFFER_SIZE];
        let n = self
            .stream
            .read(&mut buffer)
            .map_err(|e| CoreError::SocketError(e.to_string()))?;

        if n == 0 {
            return Err(CoreError::ServerDisconnected);
        }
        Ok(buffer[..n].to_vec())
    }

    /// Receive a line, stripped of CR and LF
    pub fn recv_line(&mut self) -> Result<String, CoreError> {
        let bytes = self.recv()?;
        let mut line = String::from_utf8_lossy(&bytes).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.stream
            .write_all(bytes)
            .map_err(|e| CoreError::SocketError(e.to_string()))
    }

    pub fn send_str(&mut self, s: &str) -> Result<(), CoreError> {
        self.send(s.as_bytes())
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Cross-thread shutdown handle for a session
#[derive(Debug)]
pub struct SessionCloser {
    stream: TcpStream,
}

impl SessionCloser {
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A listening socket producing sessions
#[derive(Debug)]
pub struct PortListener {
    listener: TcpListener,
    port: u16,
}

impl PortListener {
    /// Bind and listen on the given port
    pub fn bind(port: u16) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .map_err(|e| CoreError::SocketError(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| CoreError::SocketError(e.to_string()))?
            .port();
        Ok(Self { listener, port })
    }

    /// The bound port (useful when binding port 0)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next connection
    pub fn accept(&self) -> Result<Session, CoreError> {
        let (stream, _addr) = self
            .listener
            .accept()
            .map_err(|e| CoreError::SocketError(e.to_string()))?;
        Ok(Session::new(stream))
    }

    /// Unblock a pending accept from another thread by connecting once
    pub fn interrupt(port: u16) {
        let _ = TcpStream::connect(("127.0.0.1", port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_roundtrip() {
        let listener = PortListener::bind(0).unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(b"hello\r\n").unwrap();
            let mut buffer = [0u8; 16];
            let n = stream.read(&mut buffer).unwrap();
            buffer[..n].to_vec()
        });

        let mut session = listener.accept().unwrap();
        assert_eq!(session.recv_line().unwrap(), "hello");
        session.send_str("ok").unwrap();

        assert_eq!(client.join().unwrap(), b"ok");
    }

    #[test]
    fn test_clean_close_signals_disconnect() {
        let listener = PortListener::bind(0).unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            drop(stream);
        });

        let mut session = listener.accept().unwrap();
        client.join().unwrap();
        assert_eq!(session.recv(), Err(CoreError::ServerDisconnected));
    }

    #[test]
    fn test_async_close_unblocks_recv() {
        let listener = PortListener::bind(0).unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            // Keep the connection open long enough for the test body
            thread::sleep(std::time::Duration::from_millis(200));
            drop(stream);
        });

        let mut session = listener.accept().unwrap();
        let closer = session.close_handle().unwrap();

        let reader = thread::spawn(move || session.recv());
        closer.close();

        // The blocked receive fails instead of hanging
        assert!(reader.join().unwrap().is_err());
        client.join().unwrap();
    }
}
