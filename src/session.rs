//! Per-connection session handler.
//!
//! A session owns one connection for its whole lifetime and walks it
//! through the request/response state machine:
//!
//! ```text
//! AwaitingHandshake -> AwaitingRequest <-> Processing
//!                            |
//!                            v
//!                         Closed
//! ```
//!
//! The connection is shut down on every path into `Closed`, including I/O
//! errors.

use crate::protocol::{self, ParseError, Request, Response, MAX_LINE_LENGTH};
use crate::registry::Lookup;
use std::io;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, trace, warn};

/// Per-session settings
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How long to wait for one request line
    pub read_timeout: Duration,
}

/// Why a session ended without an I/O error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed its side of the connection.
    ClientClosed,
    /// The client sent a request scaling to zero.
    Stopped,
    /// The client sent a request that could not be parsed.
    Malformed(ParseError),
    /// No request line arrived within the read timeout.
    TimedOut,
}

/// Session failures
#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

#[derive(Debug)]
enum State {
    AwaitingHandshake,
    AwaitingRequest,
    Processing { delay_ms: u64 },
    Closed(SessionOutcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::AwaitingHandshake => "awaiting_handshake",
            State::AwaitingRequest => "awaiting_request",
            State::Processing { .. } => "processing",
            State::Closed(_) => "closed",
        }
    }
}

/// Result of waiting for one request line
enum ReadLine {
    Line,
    Eof,
    TimedOut,
    Invalid(ParseError),
}

/// Run a session on `stream` until it reaches `Closed`.
pub async fn handle_connection<S>(
    stream: S,
    registry: &dyn Lookup,
    config: SessionConfig,
) -> Result<SessionOutcome, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let result = run(&mut reader, &mut writer, registry, config).await;

    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "Shutdown after session failed");
    }

    result
}

async fn run<R, W>(
    reader: &mut R,
    writer: &mut W,
    registry: &dyn Lookup,
    config: SessionConfig,
) -> Result<SessionOutcome, SessionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(MAX_LINE_LENGTH);
    let mut state = State::AwaitingHandshake;

    loop {
        trace!(state = state.name(), "Session state");

        state = match state {
            State::AwaitingHandshake => {
                writer.write_all(Response::greeting()).await?;
                writer.flush().await?;
                State::AwaitingRequest
            }

            State::AwaitingRequest => {
                match read_line(reader, &mut line, config.read_timeout).await? {
                    ReadLine::TimedOut => {
                        warn!(
                            timeout_secs = config.read_timeout.as_secs(),
                            "Closing connection after read timeout"
                        );
                        State::Closed(SessionOutcome::TimedOut)
                    }
                    ReadLine::Eof => {
                        debug!("Client closed the connection");
                        State::Closed(SessionOutcome::ClientClosed)
                    }
                    ReadLine::Invalid(e) => {
                        debug!(error = %e, "Rejecting request");
                        State::Closed(SessionOutcome::Malformed(e))
                    }
                    ReadLine::Line => match protocol::parse(Some(line.as_str())) {
                        Ok(Request::Work { delay_ms }) => {
                            debug!(request = line.trim_end(), delay_ms, "Received request");
                            State::Processing { delay_ms }
                        }
                        Ok(Request::Stop) => {
                            debug!("Client requested stop");
                            State::Closed(SessionOutcome::Stopped)
                        }
                        Err(e) => {
                            debug!(error = %e, "Rejecting request");
                            State::Closed(SessionOutcome::Malformed(e))
                        }
                    },
                }
            }

            State::Processing { delay_ms } => {
                // Runs to completion even if the client has gone away
                debug!(delay_ms, "Worker sleeping");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                debug!(delay_ms, "Worker woke up");

                let value = registry.lookup(delay_ms);
                writer.write_all(&Response::lookup_result(&value)).await?;
                writer.flush().await?;
                State::AwaitingRequest
            }

            State::Closed(outcome) => return Ok(outcome),
        };
    }
}

/// Read one request line into `line`, bounded by `read_timeout`.
async fn read_line<R>(
    reader: &mut R,
    line: &mut String,
    read_timeout: Duration,
) -> io::Result<ReadLine>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();

    // One byte past the limit plus the line ending tells an over-long line apart
    let limit = (MAX_LINE_LENGTH + 2) as u64;
    let mut limited = (&mut *reader).take(limit);
    let read = tokio::time::timeout(read_timeout, limited.read_line(line)).await;

    match read {
        Err(_) => Ok(ReadLine::TimedOut),
        Ok(Ok(0)) => Ok(ReadLine::Eof),
        Ok(Ok(_)) if line.trim_end_matches(['\r', '\n']).len() > MAX_LINE_LENGTH => {
            Ok(ReadLine::Invalid(ParseError::LineTooLong))
        }
        Ok(Ok(_)) => Ok(ReadLine::Line),
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => Ok(ReadLine::Invalid(
            ParseError::Malformed("invalid UTF-8".to_string()),
        )),
        Ok(Err(e)) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::Registry;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    const NOT_FOUND: &str = "No car registered under this number";

    fn registry() -> Arc<Registry> {
        let seed = RegistryConfig::default();
        Arc::new(Registry::new(seed.entries, seed.not_found))
    }

    fn config() -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_secs(20),
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn read_line(&mut self) -> Option<String> {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                None
            } else {
                Some(line.trim_end().to_string())
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }
    }

    fn spawn_session() -> (
        Client,
        JoinHandle<Result<SessionOutcome, SessionError>>,
    ) {
        let (client, server) = duplex(4096);
        let registry = registry();
        let handle =
            tokio::spawn(async move { handle_connection(server, registry.as_ref(), config()).await });

        let (reader, writer) = tokio::io::split(client);
        let client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        (client, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_requests_on_one_connection() {
        let (mut client, handle) = spawn_session();
        assert_eq!(client.read_line().await.as_deref(), Some("Server is ready"));

        let start = Instant::now();
        client.send("1").await;
        assert_eq!(
            client.read_line().await.as_deref(),
            Some("Server returns: BMW")
        );
        assert_eq!(
            client.read_line().await.as_deref(),
            Some("Ready for a new request")
        );
        assert!(start.elapsed() >= Duration::from_millis(1000));

        let start = Instant::now();
        client.send("id2x").await;
        assert_eq!(
            client.read_line().await.as_deref(),
            Some("Server returns: Honda")
        );
        assert_eq!(
            client.read_line().await.as_deref(),
            Some("Ready for a new request")
        );
        assert!(start.elapsed() >= Duration::from_millis(2000));

        client.send("0").await;
        assert_eq!(client.read_line().await, None);
        assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_returns_not_found() {
        let (mut client, handle) = spawn_session();
        client.read_line().await;

        client.send("7").await;
        assert_eq!(
            client.read_line().await,
            Some(format!("Server returns: {NOT_FOUND}"))
        );
        assert_eq!(
            client.read_line().await.as_deref(),
            Some("Ready for a new request")
        );

        drop(client);
        assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::ClientClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_request_closes_connection() {
        let (mut client, handle) = spawn_session();
        client.read_line().await;

        client.send("abc").await;
        assert_eq!(client.read_line().await, None);
        assert_eq!(
            handle.await.unwrap().unwrap(),
            SessionOutcome::Malformed(ParseError::Malformed("abc".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_long_line_is_malformed() {
        let (mut client, handle) = spawn_session();
        client.read_line().await;

        client.send(&"7".repeat(MAX_LINE_LENGTH + 10)).await;
        assert_eq!(client.read_line().await, None);
        assert_eq!(
            handle.await.unwrap().unwrap(),
            SessionOutcome::Malformed(ParseError::LineTooLong)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_times_out() {
        let (mut client, handle) = spawn_session();
        client.read_line().await;

        let start = Instant::now();
        assert_eq!(client.read_line().await, None);
        assert!(start.elapsed() >= Duration::from_secs(20));
        assert_eq!(handle.await.unwrap().unwrap(), SessionOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_affect_other_sessions() {
        let (mut idle, idle_handle) = spawn_session();
        let (mut busy, busy_handle) = spawn_session();
        idle.read_line().await;
        busy.read_line().await;

        busy.send("3").await;
        assert_eq!(busy.read_line().await.as_deref(), Some("Server returns: Dodge"));
        busy.read_line().await;

        assert_eq!(idle.read_line().await, None);
        assert_eq!(idle_handle.await.unwrap().unwrap(), SessionOutcome::TimedOut);

        busy.send("4").await;
        assert_eq!(busy.read_line().await.as_deref(), Some("Server returns: Lada"));
        busy.read_line().await;
        busy.send("0").await;
        assert_eq!(busy_handle.await.unwrap().unwrap(), SessionOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_processing() {
        let (mut client, handle) = spawn_session();
        client.read_line().await;

        let start = Instant::now();
        client.send("1").await;
        drop(client);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SessionError::Io(_))));
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_negative_request_scripted() {
        let stream = tokio_test::io::Builder::new()
            .write(Response::greeting())
            .read(b"-5\n")
            .build();

        let outcome = handle_connection(stream, registry().as_ref(), config())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Malformed(ParseError::Negative));
    }

    #[tokio::test]
    async fn test_eof_before_request_scripted() {
        let stream = tokio_test::io::Builder::new()
            .write(Response::greeting())
            .build();

        let outcome = handle_connection(stream, registry().as_ref(), config())
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::ClientClosed);
    }
}
