//! Per-connection SCPI sessions.
//!
//! A [`ConnectionSession`] frames the bytes a client sends into command lines,
//! runs each line on the shared [`Instrument`] and writes back non-empty
//! responses terminated by a single `\n`. Nothing is sent on connect.

use crate::config::ServerConfig;
use crate::instrument::Instrument;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 4096;

/// Session behaviour taken from the `[server]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Run a device clear before serving a new connection.
    pub device_clear_on_connect: bool,
    /// Close the connection after this much silence.
    pub idle_timeout: Option<Duration>,
    /// Execute an unterminated line after this much silence.
    pub flush_unterminated_after: Duration,
    /// Unterminated input past this length is discarded.
    pub max_line_length: usize,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            device_clear_on_connect: config.device_clear_on_connect,
            idle_timeout: config.idle_timeout,
            flush_unterminated_after: config.flush_unterminated_after,
            max_line_length: config.max_line_length,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// What the framer produced from buffered input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A trimmed, non-empty command line.
    Line(String),
    /// A terminated line that was not valid UTF-8.
    Invalid(usize),
}

/// Splits a byte stream on `\r\n`, `\n` or `\r`.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_length: usize,
}

impl LineFramer {
    /// A framer discarding unterminated input longer than `max_line_length`.
    #[must_use]
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_line_length: max_line_length.max(1),
        }
    }

    /// Appends received bytes. Returns the number of bytes discarded because
    /// an unterminated line grew past the length limit.
    pub fn extend(&mut self, data: &[u8]) -> usize {
        self.buffer.extend_from_slice(data);
        let terminated = self.buffer.iter().any(|b| *b == b'\n' || *b == b'\r');
        if !terminated && self.buffer.len() > self.max_line_length {
            let dropped = self.buffer.len();
            self.buffer.clear();
            return dropped;
        }
        0
    }

    /// Next complete frame; empty lines are skipped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let end = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r')?;
            let raw = self.buffer.split_to(end);
            self.buffer.advance(1);
            if let Some(frame) = decode(&raw) {
                return Some(frame);
            }
        }
    }

    /// Takes whatever is buffered without a terminator.
    pub fn take_pending(&mut self) -> Option<Frame> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = self.buffer.split();
        decode(&raw)
    }

    /// Bytes buffered without a terminator.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }
}

fn decode(raw: &[u8]) -> Option<Frame> {
    match std::str::from_utf8(raw) {
        Ok(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| Frame::Line(text.to_string()))
        }
        Err(_) => Some(Frame::Invalid(raw.len())),
    }
}

enum Wake {
    Shutdown,
    Read(std::io::Result<usize>),
    Quiet,
}

/// Outcome of answering one frame.
#[derive(Debug, PartialEq, Eq)]
enum Answer {
    Done,
    /// Shutdown fired while the response was still being written.
    Interrupted,
}

/// One accepted client connection.
pub struct ConnectionSession {
    id: Uuid,
    peer: SocketAddr,
    instrument: Arc<Instrument>,
    settings: SessionSettings,
}

impl ConnectionSession {
    /// A session for a connection accepted from `peer`.
    #[must_use]
    pub fn new(peer: SocketAddr, instrument: Arc<Instrument>, settings: SessionSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            instrument,
            settings,
        }
    }

    /// Random id used in log fields.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Serves the connection until the client disconnects, goes idle, or
    /// `shutdown` fires.
    pub async fn run<S>(self, stream: S, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(
            instrument = %self.instrument.id(),
            peer = %self.peer,
            session = %self.id,
            "Client connected"
        );
        if self.settings.device_clear_on_connect {
            self.instrument.device_clear();
        }

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut framer = LineFramer::new(self.settings.max_line_length);
        let mut chunk = vec![0u8; READ_CHUNK];

        'session: loop {
            let wait = if framer.has_pending() {
                Some(self.settings.flush_unterminated_after)
            } else {
                self.settings.idle_timeout
            };

            let wake = tokio::select! {
                _ = shutdown.changed() => Wake::Shutdown,
                result = read_with_deadline(&mut reader, &mut chunk, wait) => match result {
                    Some(read) => Wake::Read(read),
                    None => Wake::Quiet,
                },
            };

            match wake {
                Wake::Shutdown => {
                    debug!(session = %self.id, "Session stopped by server shutdown");
                    break;
                }
                Wake::Quiet if framer.has_pending() => {
                    // Some VISA stacks never send a terminator.
                    if let Some(frame) = framer.take_pending() {
                        if self.handle_frame(frame, &mut writer, &mut shutdown).await?
                            == Answer::Interrupted
                        {
                            break;
                        }
                    }
                }
                Wake::Quiet => {
                    info!(peer = %self.peer, session = %self.id, "Idle timeout");
                    break;
                }
                Wake::Read(Ok(0)) => {
                    if let Some(frame) = framer.take_pending() {
                        // The peer may have half-closed; a failed write is not an error here.
                        let _ = self.handle_frame(frame, &mut writer, &mut shutdown).await;
                    }
                    break;
                }
                Wake::Read(Ok(n)) => {
                    let dropped = framer.extend(&chunk[..n]);
                    if dropped > 0 {
                        warn!(
                            peer = %self.peer,
                            bytes = dropped,
                            "Discarding oversize unterminated input"
                        );
                    }
                    while let Some(frame) = framer.next_frame() {
                        if self.handle_frame(frame, &mut writer, &mut shutdown).await?
                            == Answer::Interrupted
                        {
                            break 'session;
                        }
                    }
                }
                Wake::Read(Err(e)) => {
                    warn!(peer = %self.peer, error = %e, "Read error");
                    return Err(e);
                }
            }
        }

        info!(
            instrument = %self.instrument.id(),
            peer = %self.peer,
            session = %self.id,
            "Client disconnected"
        );
        Ok(())
    }

    /// Runs one frame and writes its response. A client that stops reading
    /// cannot hold the session past `shutdown`.
    async fn handle_frame<W>(
        &self,
        frame: Frame,
        writer: &mut W,
        shutdown: &mut watch::Receiver<bool>,
    ) -> std::io::Result<Answer>
    where
        W: AsyncWrite + Unpin,
    {
        let line = match frame {
            Frame::Line(line) => line,
            Frame::Invalid(len) => {
                warn!(peer = %self.peer, bytes = len, "Dropping line that is not valid UTF-8");
                return Ok(Answer::Done);
            }
        };

        let reply = self.instrument.execute(&line, &self.peer.to_string());
        if reply.response.is_empty() {
            return Ok(Answer::Done);
        }

        let mut out = Vec::with_capacity(reply.response.len() + 1);
        out.extend_from_slice(reply.response.as_bytes());
        out.push(b'\n');
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(
                    session = %self.id,
                    bytes = out.len(),
                    "Abandoning response write on server shutdown"
                );
                Ok(Answer::Interrupted)
            }
            written = write_response(writer, &out) => match written {
                Ok(()) => Ok(Answer::Done),
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Failed to write response");
                    Err(e)
                }
            },
        }
    }
}

async fn write_response<W>(writer: &mut W, out: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(out).await?;
    writer.flush().await
}

/// Reads once; `None` when `wait` elapsed first.
async fn read_with_deadline<R>(
    reader: &mut R,
    chunk: &mut [u8],
    wait: Option<Duration>,
) -> Option<std::io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    match wait {
        Some(wait) => timeout(wait, reader.read(chunk)).await.ok(),
        None => Some(reader.read(chunk).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentDefinition;
    use crate::events::EventBus;
    use crate::scpi::EngineSettings;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    fn lines(framer: &mut LineFramer) -> Vec<Frame> {
        std::iter::from_fn(|| framer.next_frame()).collect()
    }

    #[test]
    fn test_all_terminators() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"*IDN?\r\nVOLT?\nCURR?\rOUTP?");
        assert_eq!(
            lines(&mut framer),
            vec![
                Frame::Line("*IDN?".into()),
                Frame::Line("VOLT?".into()),
                Frame::Line("CURR?".into()),
            ]
        );
        assert!(framer.has_pending());
        assert_eq!(framer.take_pending(), Some(Frame::Line("OUTP?".into())));
        assert!(!framer.has_pending());
    }

    #[test]
    fn test_split_reads_and_blank_lines() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"VO");
        assert!(framer.next_frame().is_none());
        framer.extend(b"LT 5\r");
        framer.extend(b"\n\n   \r\n");
        assert_eq!(lines(&mut framer), vec![Frame::Line("VOLT 5".into())]);
        assert!(!framer.has_pending());
    }

    #[test]
    fn test_invalid_utf8_is_reported() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"\xff\xfe\nVOLT?\n");
        assert_eq!(
            lines(&mut framer),
            vec![Frame::Invalid(2), Frame::Line("VOLT?".into())]
        );
    }

    #[test]
    fn test_oversize_unterminated_input_is_discarded() {
        let mut framer = LineFramer::new(8);
        assert_eq!(framer.extend(b"0123456789"), 10);
        assert!(!framer.has_pending());
        assert_eq!(framer.extend(b"VOLT?\n"), 0);
        assert_eq!(lines(&mut framer), vec![Frame::Line("VOLT?".into())]);
    }

    fn instrument() -> Arc<Instrument> {
        let definition = InstrumentDefinition::new("Test PSU")
            .with_command("VOLT (.+)", "OK", "range:0,30")
            .with_command("VOLT?", "0.0", "");
        Arc::new(
            Instrument::new(&definition, 0, &EngineSettings::default(), EventBus::default())
                .unwrap(),
        )
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_session_over_duplex_stream() {
        let psu = instrument();
        let (client, server) = duplex(1024);
        let (_tx, rx) = watch::channel(false);
        let session = ConnectionSession::new(peer(), psu.clone(), SessionSettings::default());
        let task = tokio::spawn(session.run(server, rx));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half).lines();

        write_half.write_all(b"VOLT 12\nVOLT 99\nVOLT?\n").await.unwrap();
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "OK");
        // The failed set sends nothing back.
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "12");

        write_half.write_all(b"SYST:ERR?\r\n").await.unwrap();
        assert_eq!(
            reader.next_line().await.unwrap().unwrap(),
            "-222,\"Data out of range;99\""
        );

        drop(write_half);
        drop(reader);
        task.await.unwrap().unwrap();
        assert_eq!(psu.command_count(), 4);
    }

    #[tokio::test]
    async fn test_unterminated_command_is_flushed_after_silence() {
        let psu = instrument();
        let (client, server) = duplex(1024);
        let (_tx, rx) = watch::channel(false);
        let settings = SessionSettings {
            flush_unterminated_after: Duration::from_millis(50),
            ..Default::default()
        };
        tokio::spawn(ConnectionSession::new(peer(), psu, settings).run(server, rx));

        let (read_half, mut write_half) = tokio::io::split(client);
        let mut reader = BufReader::new(read_half).lines();
        write_half.write_all(b"*OPC?").await.unwrap();

        let line = timeout(Duration::from_secs(2), reader.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "1");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_session() {
        let (_client, server) = duplex(64);
        let (_tx, rx) = watch::channel(false);
        let settings = SessionSettings {
            idle_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let session = ConnectionSession::new(peer(), instrument(), settings);
        let result = timeout(Duration::from_secs(2), session.run(server, rx)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_shutdown_signal_ends_session() {
        let (_client, server) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let session = ConnectionSession::new(peer(), instrument(), SessionSettings::default());
        let task = tokio::spawn(session.run(server, rx));

        tx.send(true).unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_response_write() {
        let definition = InstrumentDefinition::new("Scope")
            .with_command("CURV?", "7".repeat(64 * 1024), "");
        let scope = Arc::new(
            Instrument::new(&definition, 0, &EngineSettings::default(), EventBus::default())
                .unwrap(),
        );
        // The client never reads, so the 256-byte pipe fills long before the
        // response is written.
        let (client, server) = duplex(256);
        let (tx, rx) = watch::channel(false);
        let session = ConnectionSession::new(peer(), scope.clone(), SessionSettings::default());
        let task = tokio::spawn(session.run(server, rx));

        let (_read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"CURV?\n").await.unwrap();
        while scope.command_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_device_clear_on_connect_policy() {
        let psu = instrument();
        psu.process("VOLT 7", "shell");

        let (_client, server) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let keep = SessionSettings {
            device_clear_on_connect: false,
            ..Default::default()
        };
        let task = tokio::spawn(ConnectionSession::new(peer(), psu.clone(), keep).run(server, rx));
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(psu.state_snapshot()["VOLT"], "7");

        let (_client, server) = duplex(64);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(
            ConnectionSession::new(peer(), psu.clone(), SessionSettings::default()).run(server, rx),
        );
        tokio::task::yield_now().await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(psu.state_snapshot()["VOLT"], "0.0");
    }
}
