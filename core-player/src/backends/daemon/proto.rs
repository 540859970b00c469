//! Minimal client for the MPD line protocol.
//!
//! Request: one command line. Response: `key: value` lines terminated by
//! `OK`, or a single `ACK ...` line on failure. The server greets with
//! `OK MPD <version>` on connect.
//!
//! Every read and write carries a short deadline except `idle`, which blocks
//! by design until a subsystem changes.

use crate::error::{PlayerError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const IO_DEADLINE: Duration = Duration::from_secs(2);

/// Parsed `key: value` response.
#[derive(Debug, Default)]
pub struct Response {
    pairs: Vec<(String, String)>,
}

impl Response {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn parse_line(&mut self, line: &str) {
        if let Some((key, value)) = line.split_once(": ") {
            self.pairs.push((key.to_string(), value.to_string()));
        }
    }
}

/// Quote a command argument. The protocol uses double quotes with backslash
/// escapes for quotes and backslashes.
pub fn escape_arg(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len() + 2);
    out.push('"');
    for ch in arg.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

pub struct DaemonConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DaemonConnection {
    /// Dial and consume the greeting.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = tokio::time::timeout(IO_DEADLINE, TcpStream::connect(addr))
            .await
            .map_err(|_| PlayerError::Timeout(format!("connect {addr}")))?
            .map_err(|err| PlayerError::Protocol(format!("connect {addr}: {err}")))?;

        let (read_half, write_half) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = conn.read_line_deadline().await?;
        if !greeting.starts_with("OK MPD") {
            return Err(PlayerError::Protocol(format!(
                "unexpected greeting: {greeting}"
            )));
        }
        Ok(conn)
    }

    /// Send one command and collect its response.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.write_line(command).await?;
        self.read_response().await
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.command("ping").await.map(|_| ())
    }

    /// Block until one of the named subsystems changes. Returns the changed
    /// subsystems. No deadline; cancel by dropping the connection.
    pub async fn idle(&mut self, subsystems: &str) -> Result<Vec<String>> {
        self.write_line(&format!("idle {subsystems}")).await?;

        let mut changed = Vec::new();
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|err| PlayerError::Protocol(format!("idle read: {err}")))?;
            if read == 0 {
                return Err(PlayerError::Protocol("connection closed".to_string()));
            }
            let line = line.trim_end();
            if line == "OK" {
                return Ok(changed);
            }
            if let Some(ack) = line.strip_prefix("ACK ") {
                return Err(PlayerError::Protocol(ack.to_string()));
            }
            if let Some(subsystem) = line.strip_prefix("changed: ") {
                changed.push(subsystem.to_string());
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut buf = line.to_string();
        buf.push('\n');
        tokio::time::timeout(IO_DEADLINE, async {
            self.writer.write_all(buf.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| PlayerError::Timeout(format!("send '{line}'")))?
        .map_err(|err| PlayerError::Protocol(format!("send '{line}': {err}")))
    }

    async fn read_response(&mut self) -> Result<Response> {
        let mut response = Response::default();
        loop {
            let line = self.read_line_deadline().await?;
            if line == "OK" {
                return Ok(response);
            }
            if let Some(ack) = line.strip_prefix("ACK ") {
                return Err(PlayerError::Protocol(ack.to_string()));
            }
            response.parse_line(&line);
        }
    }

    async fn read_line_deadline(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(IO_DEADLINE, self.reader.read_line(&mut line))
            .await
            .map_err(|_| PlayerError::Timeout("daemon response".to_string()))?
            .map_err(|err| PlayerError::Protocol(format!("read: {err}")))?;
        if read == 0 {
            return Err(PlayerError::Protocol("connection closed".to_string()));
        }
        Ok(line.trim_end().to_string())
    }
}

/// Command connection that redials transparently. A ping precedes every
/// command; a dead connection is replaced instead of surfacing the error.
pub struct SharedConnection {
    addr: String,
    conn: tokio::sync::Mutex<Option<DaemonConnection>>,
}

impl SharedConnection {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn command(&self, command: &str) -> Result<Response> {
        let mut guard = self.conn.lock().await;

        if let Some(conn) = guard.as_mut() {
            if conn.ping().await.is_err() {
                *guard = None;
            }
        }
        if guard.is_none() {
            *guard = Some(DaemonConnection::connect(&self.addr).await?);
        }

        let conn = guard.as_mut().ok_or(PlayerError::ChannelClosed)?;
        match conn.command(command).await {
            Ok(response) => Ok(response),
            Err(err) => {
                // Drop the connection so the next command redials.
                *guard = None;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_arg() {
        assert_eq!(escape_arg("plain"), "\"plain\"");
        assert_eq!(escape_arg("with \"quotes\""), "\"with \\\"quotes\\\"\"");
        assert_eq!(escape_arg("back\\slash"), "\"back\\\\slash\"");
    }

    #[test]
    fn test_response_parsing() {
        let mut response = Response::default();
        response.parse_line("state: play");
        response.parse_line("volume: 60");
        response.parse_line("elapsed: 12.500");
        assert_eq!(response.get("state"), Some("play"));
        assert_eq!(response.get("Volume"), Some("60"));
        assert_eq!(response.get("elapsed"), Some("12.500"));
        assert_eq!(response.get("missing"), None);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_greeting() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"HELLO\n").await.unwrap();
        });

        let result = DaemonConnection::connect(&addr).await;
        assert!(matches!(result, Err(PlayerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_command_roundtrip_and_ack() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(b"OK MPD 0.23.5\n").await.unwrap();

            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.as_str() {
                    "status" => {
                        write_half
                            .write_all(b"state: play\nvolume: 45\nOK\n")
                            .await
                            .unwrap();
                    }
                    _ => {
                        write_half
                            .write_all(b"ACK [5@0] {} unknown command\n")
                            .await
                            .unwrap();
                    }
                }
            }
        });

        let mut conn = DaemonConnection::connect(&addr).await.unwrap();
        let status = conn.command("status").await.unwrap();
        assert_eq!(status.get("state"), Some("play"));
        assert_eq!(status.get("volume"), Some("45"));

        let err = conn.command("bogus").await.unwrap_err();
        assert!(matches!(err, PlayerError::Protocol(_)));
    }
}
