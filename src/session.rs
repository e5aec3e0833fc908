//! AGI session: handshake, background reader and the command round trip

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    buffer::LineReader,
    channel::ChannelState,
    command::{command_line, epoch_seconds, AgiCommand, AgiResponse, RecordOptions},
    constants::{LINE_TERMINATOR, MAX_LINE_SIZE},
    error::{AgiError, AgiResult},
    protocol::{parse_variable_line, Frame, ReplyAssembler},
    variables::{AgiVariable, AgiVariables},
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Auxiliary EAGI audio stream handed out by [`AgiSession::take_eagi`].
pub type EagiReader = Box<dyn AsyncRead + Send + Unpin>;

/// Session status
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionStatus {
    /// Commands can be sent.
    Active,
    /// The session ended and will not accept further commands.
    Closed(DisconnectReason),
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean end of stream from the switch
    ConnectionClosed,
    /// Read failure (io::Error is not Clone, so we store the message)
    IoError(String),
    /// The switch sent a line that is not a valid reply
    ProtocolError(String),
    /// [`AgiSession::close()`] was called
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested close"),
        }
    }
}

/// Options fixed when a session is constructed.
#[derive(Debug, Clone)]
pub struct AgiSessionOptions {
    /// Bound on reading the handshake block. Default: `None` (wait forever).
    pub handshake_timeout: Option<Duration>,
    /// Longest line accepted from the switch. Default: 64 KiB.
    pub max_line_length: usize,
}

impl Default for AgiSessionOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            max_line_length: MAX_LINE_SIZE,
        }
    }
}

/// Shared state between AgiSession handles and the reader task
struct SharedState {
    pending_reply: Mutex<Option<oneshot::Sender<AgiResult<AgiResponse>>>>,
    hangup_received: AtomicBool,
    stray_replies: AtomicU64,
    status_tx: watch::Sender<SessionStatus>,
}

impl SharedState {
    /// Mark the session closed, then fail the command in flight.
    ///
    /// The status is published before the pending slot is drained; `round_trip`
    /// stores its slot before re-checking the status, so a command is never
    /// left waiting on a dead reader.
    async fn shut_down(&self, reason: DisconnectReason, error: AgiError) -> bool {
        let transitioned = self
            .status_tx
            .send_if_modified(|status| {
                if *status == SessionStatus::Active {
                    *status = SessionStatus::Closed(reason);
                    true
                } else {
                    false
                }
            });
        if let Some(tx) = self
            .pending_reply
            .lock()
            .await
            .take()
        {
            let _ = tx.send(Err(error));
        }
        transitioned
    }

    async fn clear_pending(&self) {
        self.pending_reply
            .lock()
            .await
            .take();
    }
}

/// AGI session handle (Clone + Send)
///
/// One handshake followed by a strictly serialized command loop over a
/// duplex stream. Commands are serialized through the writer mutex, which is
/// held through the whole write-and-wait cycle. A background reader task
/// routes each reply to the command in flight.
#[derive(Clone)]
pub struct AgiSession {
    variables: Arc<AgiVariables>,
    writer: Arc<Mutex<BoxedWriter>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<SessionStatus>,
    reader_task: Arc<JoinHandle<()>>,
    eagi: Arc<std::sync::Mutex<Option<EagiReader>>>,
    peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for AgiSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgiSession")
            .field("channel", &self.variables.channel())
            .field("peer_addr", &self.peer_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Consume the handshake block up to and including its blank line.
async fn read_handshake<R: AsyncRead + Unpin>(
    lines: &mut LineReader<R>,
) -> AgiResult<AgiVariables> {
    let mut variables = AgiVariables::new();
    loop {
        let Some(line) = lines
            .next_line()
            .await?
        else {
            return Err(AgiError::HandshakeIncomplete);
        };
        if line.is_empty() {
            break;
        }
        trace!("[HANDSHAKE] {}", line);
        if let Some((key, value)) = parse_variable_line(&line) {
            variables.insert(key, value);
        }
    }
    debug!("Handshake complete: {} variables", variables.len());
    Ok(variables)
}

/// Background reader loop
async fn reader_loop(lines: LineReader<BoxedReader>, shared: Arc<SharedState>) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(lines, shared.clone()));
    if futures_util::FutureExt::catch_unwind(result)
        .await
        .is_err()
    {
        tracing::error!("reader task panicked");
        shared
            .shut_down(
                DisconnectReason::IoError("reader task panicked".to_string()),
                AgiError::ConnectionClosed,
            )
            .await;
    }
}

async fn reader_loop_inner(mut lines: LineReader<BoxedReader>, shared: Arc<SharedState>) {
    let mut assembler = ReplyAssembler::with_limit(lines.max_line());

    loop {
        let line = match lines
            .next_line()
            .await
        {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Connection closed (EOF)");
                shared
                    .shut_down(DisconnectReason::ConnectionClosed, AgiError::ConnectionClosed)
                    .await;
                return;
            }
            Err(e) => {
                warn!("Read error: {}", e);
                let reason = match &e {
                    AgiError::Io(io) => DisconnectReason::IoError(io.to_string()),
                    other => DisconnectReason::ProtocolError(other.to_string()),
                };
                shared
                    .shut_down(reason, e)
                    .await;
                return;
            }
        };

        trace!("[RECV] {}", line);

        match assembler.feed(line) {
            Ok(Frame::Reply(response)) => {
                let mut pending = shared
                    .pending_reply
                    .lock()
                    .await;
                if let Some(tx) = pending.take() {
                    let _ = tx.send(Ok(response));
                } else {
                    shared
                        .stray_replies
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("Discarding reply with no command in flight: {}", response);
                }
            }
            Ok(Frame::Hangup) => {
                debug!("Received HANGUP notification");
                shared
                    .hangup_received
                    .store(true, Ordering::Relaxed);
            }
            Ok(Frame::Skip) => {}
            Err(e) => {
                warn!("Parser error: {}", e);
                shared
                    .shut_down(DisconnectReason::ProtocolError(e.to_string()), e)
                    .await;
                return;
            }
        }
    }
}

/// Map a `-1` result to an error; AGI uses it for "command failed".
fn check_failure(command: &str, response: AgiResponse) -> AgiResult<AgiResponse> {
    if response.result() == Some(-1) {
        return Err(AgiError::UnexpectedResult {
            command: command.to_string(),
            result: response
                .result_string()
                .to_string(),
        });
    }
    Ok(response)
}

/// Decode the digit that interrupted playback, if any.
fn interrupt_digit(command: &str, response: AgiResponse) -> AgiResult<Option<char>> {
    check_failure(command, response).map(|r| r.digit())
}

impl AgiSession {
    /// Start a session on an arbitrary duplex stream, reading the handshake
    /// before returning.
    pub async fn new<R, W>(reader: R, writer: W) -> AgiResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_options(reader, writer, AgiSessionOptions::default()).await
    }

    /// Like [`new`](Self::new), with explicit options.
    pub async fn with_options<R, W>(
        reader: R,
        writer: W,
        options: AgiSessionOptions,
    ) -> AgiResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), None, None, options).await
    }

    /// Start an EAGI session: `eagi` is the auxiliary audio stream,
    /// retrievable with [`take_eagi`](Self::take_eagi).
    pub async fn with_eagi<R, W, E>(
        reader: R,
        writer: W,
        eagi: E,
        options: AgiSessionOptions,
    ) -> AgiResult<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self::build(
            Box::new(reader),
            Box::new(writer),
            Some(Box::new(eagi)),
            None,
            options,
        )
        .await
    }

    /// Session over the process's standard streams, as when Asterisk runs
    /// the program directly from the dialplan.
    pub async fn stdio() -> AgiResult<Self> {
        Self::with_options(
            tokio::io::stdin(),
            tokio::io::stdout(),
            AgiSessionOptions::default(),
        )
        .await
    }

    /// EAGI session over the standard streams, with audio on file
    /// descriptor 3.
    #[cfg(unix)]
    pub async fn eagi_stdio() -> AgiResult<Self> {
        let audio = tokio::fs::File::open(crate::constants::EAGI_AUDIO_PATH).await?;
        Self::with_eagi(
            tokio::io::stdin(),
            tokio::io::stdout(),
            audio,
            AgiSessionOptions::default(),
        )
        .await
    }

    /// Session over an accepted FastAGI connection.
    pub async fn from_tcp(stream: TcpStream, options: AgiSessionOptions) -> AgiResult<Self> {
        let peer_addr = stream
            .peer_addr()
            .ok();
        let (read_half, write_half) = stream.into_split();
        Self::build(
            Box::new(read_half),
            Box::new(write_half),
            None,
            peer_addr,
            options,
        )
        .await
    }

    async fn build(
        reader: BoxedReader,
        writer: BoxedWriter,
        eagi: Option<EagiReader>,
        peer_addr: Option<SocketAddr>,
        options: AgiSessionOptions,
    ) -> AgiResult<Self> {
        let mut lines = LineReader::new(reader, options.max_line_length);

        let variables = match options.handshake_timeout {
            Some(limit) => timeout(limit, read_handshake(&mut lines))
                .await
                .map_err(|_| AgiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })??,
            None => read_handshake(&mut lines).await?,
        };

        let (status_tx, status_rx) = watch::channel(SessionStatus::Active);
        let shared = Arc::new(SharedState {
            pending_reply: Mutex::new(None),
            hangup_received: AtomicBool::new(false),
            stray_replies: AtomicU64::new(0),
            status_tx,
        });

        let reader_task = tokio::spawn(reader_loop(lines, shared.clone()));

        Ok(Self {
            variables: Arc::new(variables),
            writer: Arc::new(Mutex::new(writer)),
            shared,
            status_rx,
            reader_task: Arc::new(reader_task),
            eagi: Arc::new(std::sync::Mutex::new(eagi)),
            peer_addr,
        })
    }

    /// Write one command line and wait for its reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle so
    /// concurrent callers queue instead of overwriting the pending reply slot.
    async fn round_trip(&self, limit: Duration, line: String) -> AgiResult<AgiResponse> {
        if !self.is_connected() {
            return Err(AgiError::NotConnected);
        }

        debug!("Sending command: {}", line);

        let mut writer = self
            .writer
            .lock()
            .await;

        let (tx, rx) = oneshot::channel();
        *self
            .shared
            .pending_reply
            .lock()
            .await = Some(tx);

        // The reader may have shut down between the first check and storing tx.
        if !self.is_connected() {
            self.shared
                .clear_pending()
                .await;
            return Err(AgiError::NotConnected);
        }

        let mut framed = line;
        framed.push_str(LINE_TERMINATOR);
        let mut written = writer
            .write_all(framed.as_bytes())
            .await;
        if written.is_ok() {
            written = writer
                .flush()
                .await;
        }
        if let Err(e) = written {
            warn!("Write error: {}", e);
            self.shared
                .shut_down(
                    DisconnectReason::IoError(e.to_string()),
                    AgiError::ConnectionClosed,
                )
                .await;
            return Err(AgiError::Io(e));
        }

        let outcome = if limit.is_zero() {
            rx.await
        } else {
            match timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.shared
                        .clear_pending()
                        .await;
                    let timeout_ms = limit.as_millis() as u64;
                    warn!(
                        "No reply within {}ms to: {}",
                        timeout_ms,
                        framed.trim_end()
                    );
                    return Err(AgiError::Timeout { timeout_ms });
                }
            }
        };

        drop(writer);

        let response = outcome.map_err(|_| AgiError::ConnectionClosed)??;
        debug!("Received response: {}", response);
        Ok(response)
    }

    /// Send raw command tokens, joined with single spaces, and require a 200
    /// reply.
    ///
    /// A zero `timeout` waits indefinitely. On timeout the reply is abandoned,
    /// not cancelled: if it arrives later while another command is in
    /// flight, it is taken as that command's reply.
    ///
    /// ```rust,no_run
    /// # use std::time::Duration;
    /// # async fn example(session: &asterisk_agi_tokio::AgiSession) -> Result<(), asterisk_agi_tokio::AgiError> {
    /// let reply = session
    ///     .execute(Duration::from_secs(5), ["GET", "VARIABLE", "CALLERID(num)"])
    ///     .await?;
    /// println!("{:?}", reply.value());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<I, S>(&self, timeout: Duration, tokens: I) -> AgiResult<AgiResponse>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.execute_raw(timeout, tokens)
            .await?
            .into_result()
    }

    /// Like [`execute`](Self::execute), but returns non-200 replies as `Ok`.
    pub async fn execute_raw<I, S>(&self, timeout: Duration, tokens: I) -> AgiResult<AgiResponse>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let line = command_line(tokens)?;
        self.round_trip(timeout, line)
            .await
    }

    /// Send a typed command with its default timeout.
    pub async fn send_command(&self, command: &AgiCommand) -> AgiResult<AgiResponse> {
        self.send_command_with_timeout(command, command.default_timeout())
            .await
    }

    /// Send a typed command with an explicit timeout (zero waits forever).
    pub async fn send_command_with_timeout(
        &self,
        command: &AgiCommand,
        timeout: Duration,
    ) -> AgiResult<AgiResponse> {
        let line = command.to_wire_format()?;
        self.round_trip(timeout, line)
            .await?
            .into_result()
    }

    /// Answer the channel.
    pub async fn answer(&self) -> AgiResult<()> {
        let response = self
            .send_command(&AgiCommand::Answer)
            .await?;
        check_failure("ANSWER", response).map(|_| ())
    }

    /// Hang up the current channel, or the named one.
    pub async fn hangup(&self, channel: Option<&str>) -> AgiResult<()> {
        let response = self
            .send_command(&AgiCommand::Hangup {
                channel: channel.map(str::to_string),
            })
            .await?;
        check_failure("HANGUP", response).map(|_| ())
    }

    /// State of the current channel, or the named one.
    pub async fn channel_status(&self, channel: Option<&str>) -> AgiResult<ChannelState> {
        let response = self
            .send_command(&AgiCommand::ChannelStatus {
                channel: channel.map(str::to_string),
            })
            .await?;
        response
            .result()
            .and_then(ChannelState::from_number)
            .ok_or_else(|| AgiError::UnexpectedResult {
                command: "CHANNEL STATUS".to_string(),
                result: response
                    .result_string()
                    .to_string(),
            })
    }

    /// Run a dialplan application. The reply's result is the application's
    /// return value; `-2` means the application was not found.
    pub async fn exec(&self, application: &str, options: Option<&str>) -> AgiResult<AgiResponse> {
        self.send_command(&AgiCommand::Exec {
            application: application.to_string(),
            options: options.map(str::to_string),
        })
        .await
    }

    /// Read a channel variable; `None` when it is not set.
    pub async fn get_variable(&self, name: &str) -> AgiResult<Option<String>> {
        let response = self
            .send_command(&AgiCommand::GetVariable {
                name: name.to_string(),
            })
            .await?;
        if response.result() == Some(1) {
            Ok(Some(
                response
                    .value()
                    .unwrap_or_default()
                    .to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Set a channel variable.
    pub async fn set_variable(&self, name: &str, value: &str) -> AgiResult<()> {
        self.send_command(&AgiCommand::SetVariable {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }

    /// Play `prompt` and collect up to `max_digits` DTMF digits.
    pub async fn get_data(
        &self,
        prompt: &str,
        timeout: Option<Duration>,
        max_digits: Option<u32>,
    ) -> AgiResult<String> {
        let response = self
            .send_command(&AgiCommand::GetData {
                prompt: Some(prompt.to_string()),
                timeout,
                max_digits,
            })
            .await?;
        check_failure("GET DATA", response).map(|r| {
            r.result_string()
                .to_string()
        })
    }

    /// Play an audio file; returns the escape digit that interrupted it.
    pub async fn stream_file(&self, file: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::StreamFile {
                file: file.to_string(),
                escape_digits: escape_digits.to_string(),
                offset: 0,
            })
            .await?;
        interrupt_digit("STREAM FILE", response)
    }

    /// Record audio to `file` (without extension).
    pub async fn record_file(&self, file: &str, options: &RecordOptions) -> AgiResult<AgiResponse> {
        let response = self
            .send_command(&AgiCommand::RecordFile {
                file: file.to_string(),
                options: options.clone(),
            })
            .await?;
        check_failure("RECORD FILE", response)
    }

    pub async fn say_alpha(&self, text: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayAlpha {
                text: text.to_string(),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY ALPHA", response)
    }

    pub async fn say_digits(&self, digits: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayDigits {
                digits: digits.to_string(),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY DIGITS", response)
    }

    pub async fn say_number(&self, number: i64, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayNumber {
                number: number.to_string(),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY NUMBER", response)
    }

    pub async fn say_phonetic(&self, text: &str, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayPhonetic {
                text: text.to_string(),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY PHONETIC", response)
    }

    pub async fn say_date(&self, when: SystemTime, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayDate {
                epoch: epoch_seconds(when),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY DATE", response)
    }

    pub async fn say_time(&self, when: SystemTime, escape_digits: &str) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayTime {
                epoch: epoch_seconds(when),
                escape_digits: escape_digits.to_string(),
            })
            .await?;
        interrupt_digit("SAY TIME", response)
    }

    /// Say a timestamp. `format` follows voicemail.conf; `None` uses the
    /// Asterisk default.
    pub async fn say_datetime(
        &self,
        when: SystemTime,
        escape_digits: &str,
        format: Option<&str>,
        timezone: Option<&str>,
    ) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::SayDateTime {
                epoch: epoch_seconds(when),
                escape_digits: escape_digits.to_string(),
                format: format.map(str::to_string),
                timezone: timezone.map(str::to_string),
            })
            .await?;
        interrupt_digit("SAY DATETIME", response)
    }

    /// Log to the Asterisk verbose log at `level` (1-4).
    pub async fn verbose(&self, message: &str, level: u8) -> AgiResult<()> {
        self.send_command(&AgiCommand::Verbose {
            message: message.to_string(),
            level,
        })
        .await
        .map(|_| ())
    }

    /// Wait for one DTMF digit; `None` waits forever.
    pub async fn wait_for_digit(&self, timeout: Option<Duration>) -> AgiResult<Option<char>> {
        let response = self
            .send_command(&AgiCommand::WaitForDigit { timeout })
            .await?;
        interrupt_digit("WAIT FOR DIGIT", response)
    }

    /// Close the session and shut down the output stream.
    ///
    /// A command in flight fails with [`AgiError::NotConnected`].
    pub async fn close(&self) -> AgiResult<()> {
        let was_active = self
            .shared
            .shut_down(DisconnectReason::ClientRequested, AgiError::NotConnected)
            .await;
        self.reader_task
            .abort();
        if !was_active {
            return Ok(());
        }

        info!("Closing AGI session");
        let mut writer = self
            .writer
            .lock()
            .await;
        writer
            .shutdown()
            .await
            .map_err(AgiError::Io)
    }

    /// Whether the session still accepts commands.
    pub fn is_connected(&self) -> bool {
        matches!(
            *self
                .status_rx
                .borrow(),
            SessionStatus::Active
        )
    }

    pub fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    /// Current session status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status_rx
            .borrow()
            .clone()
    }

    /// Whether the switch has sent a `HANGUP` notification.
    pub fn hangup_received(&self) -> bool {
        self.shared
            .hangup_received
            .load(Ordering::Relaxed)
    }

    /// Replies discarded because no command was waiting for them.
    pub fn stray_reply_count(&self) -> u64 {
        self.shared
            .stray_replies
            .load(Ordering::Relaxed)
    }

    /// Variables received in the handshake.
    pub fn variables(&self) -> &AgiVariables {
        &self.variables
    }

    /// Shorthand for `variables().get(key)`.
    pub fn variable(&self, key: impl AsRef<str>) -> Option<&str> {
        self.variables
            .get(key)
    }

    /// Script arguments (`agi_arg_N`) in order.
    pub fn arguments(&self) -> Vec<&str> {
        self.variables
            .arguments()
    }

    /// `agi_request`
    pub fn request(&self) -> Option<&str> {
        self.variable(AgiVariable::Request)
    }

    /// Remote address for FastAGI sessions.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Take the EAGI audio stream. Returns `None` for plain AGI sessions and
    /// on every call after the first.
    pub fn take_eagi(&self) -> Option<EagiReader> {
        self.eagi
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{
        duplex, split, AsyncBufReadExt, AsyncReadExt, BufReader, DuplexStream, Lines, ReadHalf,
        WriteHalf,
    };
    use tokio::time::Instant;

    const HANDSHAKE: &str = "agi_request: agi://127.0.0.1/ivr\n\
        agi_channel: SIP/100-00000001\n\
        agi_language: en\n\
        agi_uniqueid: 1700000000.1\n\
        agi_arg_1: first\n\
        \n";

    /// Switch side of a duplex session.
    struct FakeSwitch {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeSwitch {
        async fn expect_command(&mut self) -> String {
            self.lines
                .next_line()
                .await
                .unwrap()
                .expect("session closed its output")
        }

        async fn reply(&mut self, text: &str) {
            self.writer
                .write_all(format!("{text}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    async fn connect_with(handshake: &str) -> (AgiSession, FakeSwitch) {
        let (local, peer) = duplex(4096);
        let (peer_read, mut peer_write) = split(peer);
        peer_write
            .write_all(handshake.as_bytes())
            .await
            .unwrap();
        let (read_half, write_half) = split(local);
        let session = AgiSession::new(read_half, write_half)
            .await
            .unwrap();
        let switch = FakeSwitch {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };
        (session, switch)
    }

    async fn connect() -> (AgiSession, FakeSwitch) {
        connect_with(HANDSHAKE).await
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_handshake_variables() {
        let (session, _switch) = connect().await;
        assert_eq!(session.variables().len(), 5);
        assert_eq!(session.variable(AgiVariable::Channel), Some("SIP/100-00000001"));
        assert_eq!(session.variable("agi_language"), Some("en"));
        assert_eq!(session.request(), Some("agi://127.0.0.1/ivr"));
        assert_eq!(session.arguments(), vec!["first"]);
        assert_eq!(session.peer_addr(), None);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_trims_and_last_duplicate_wins() {
        let (session, _switch) = connect_with(
            "agi_channel :  SIP/1  \r\nagi_context: first\nnot a variable\nagi_context: second\n\n",
        )
        .await;
        let vars = session.variables();
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.channel(), Some("SIP/1"));
        assert_eq!(vars.context(), Some("second"));
    }

    #[tokio::test]
    async fn test_handshake_eof_is_incomplete() {
        let (local, mut peer) = duplex(1024);
        peer.write_all(b"agi_channel: SIP/1\n")
            .await
            .unwrap();
        drop(peer);
        let (read_half, write_half) = split(local);
        let err = AgiSession::new(read_half, write_half)
            .await
            .unwrap_err();
        assert!(matches!(err, AgiError::HandshakeIncomplete));
    }

    #[tokio::test]
    async fn test_handshake_timeout_option() {
        let (local, _peer) = duplex(1024);
        let (read_half, write_half) = split(local);
        let options = AgiSessionOptions {
            handshake_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let err = AgiSession::with_options(read_half, write_half, options)
            .await
            .unwrap_err();
        assert!(matches!(err, AgiError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn test_execute_writes_line_and_parses_reply() {
        let (session, mut switch) = connect().await;
        let (result, ()) = tokio::join!(
            session.execute(SECOND, ["STREAM", "FILE", "hello-world", "\"\"", "0"]),
            async {
                assert_eq!(
                    switch
                        .expect_command()
                        .await,
                    "STREAM FILE hello-world \"\" 0"
                );
                switch
                    .reply("200 result=0 endpos=8000")
                    .await;
            }
        );
        let response = result.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.result(), Some(0));
        assert_eq!(response.attribute("endpos"), Some("8000"));
    }

    #[tokio::test]
    async fn test_hangup_line_skipped_before_reply() {
        let (session, mut switch) = connect().await;
        let (result, ()) = tokio::join!(session.execute(SECOND, ["CHANNEL", "STATUS"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("HANGUP\n200 result=1 (avail)")
                .await;
        });
        let response = result.unwrap();
        assert_eq!(response.result(), Some(1));
        assert_eq!(response.value(), Some("avail"));
        assert!(session.hangup_received());
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_reply_closes_session() {
        let (session, mut switch) = connect().await;
        let (result, ()) = tokio::join!(session.execute(SECOND, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("banana\n200 result=0")
                .await;
        });
        match result {
            Err(AgiError::MalformedReply { line }) => assert_eq!(line, "banana"),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(session.is_closed());
        assert!(matches!(
            session.status(),
            SessionStatus::Closed(DisconnectReason::ProtocolError(_))
        ));
        assert_eq!(session.stray_reply_count(), 0);
    }

    #[tokio::test]
    async fn test_latin1_handshake_and_reply_accepted() {
        let (local, peer) = duplex(4096);
        let (peer_read, mut peer_write) = split(peer);
        peer_write
            .write_all(b"agi_channel: SIP/1\nagi_calleridname: Jos\xe9\n\n")
            .await
            .unwrap();
        let (read_half, write_half) = split(local);
        let session = AgiSession::new(read_half, write_half)
            .await
            .unwrap();
        assert_eq!(
            session
                .variables()
                .get(AgiVariable::CallerIdName),
            Some("Jos\u{fffd}")
        );

        let mut switch = FakeSwitch {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };
        let (result, ()) = tokio::join!(session.execute(SECOND, ["GET", "VARIABLE", "NAME"]), async {
            switch
                .expect_command()
                .await;
            switch
                .writer
                .write_all(b"200 result=1 (Jos\xe9)\n")
                .await
                .unwrap();
        });
        assert_eq!(
            result
                .unwrap()
                .value(),
            Some("Jos\u{fffd}")
        );
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_oversized_reply_is_fatal() {
        let (local, peer) = duplex(4096);
        let (peer_read, mut peer_write) = split(peer);
        peer_write
            .write_all(HANDSHAKE.as_bytes())
            .await
            .unwrap();
        let (read_half, write_half) = split(local);
        let options = AgiSessionOptions {
            max_line_length: 64,
            ..Default::default()
        };
        let session = AgiSession::with_options(read_half, write_half, options)
            .await
            .unwrap();
        let mut switch = FakeSwitch {
            lines: BufReader::new(peer_read).lines(),
            writer: peer_write,
        };

        let long_reply = format!("200 result=1 ({})", "x".repeat(100));
        let (result, ()) = tokio::join!(session.execute(SECOND, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply(&long_reply)
                .await;
        });
        let err = result.unwrap_err();
        assert!(matches!(err, AgiError::FramingError { .. }));
        assert!(err.is_session_fatal());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_timeout_respects_duration() {
        let (session, mut switch) = connect().await;
        let limit = Duration::from_millis(100);
        let start = Instant::now();
        let (result, command) = tokio::join!(
            session.execute(limit, ["WAIT", "FOR", "DIGIT", "-1"]),
            switch.expect_command()
        );
        let elapsed = start.elapsed();

        assert_eq!(command, "WAIT FOR DIGIT -1");
        assert!(matches!(result, Err(AgiError::Timeout { timeout_ms: 100 })));
        assert!(elapsed >= limit, "returned after {elapsed:?}");
        assert!(elapsed < SECOND, "returned after {elapsed:?}");
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_commands_do_not_interleave() {
        let (session, mut switch) = connect().await;

        let a = session.clone();
        let first = tokio::spawn(async move { a.execute(SECOND * 2, ["NOOP", "A"]).await });
        let b = session.clone();
        let second = tokio::spawn(async move { b.execute(SECOND * 2, ["NOOP", "B"]).await });

        let line1 = switch
            .expect_command()
            .await;
        let early = tokio::time::timeout(Duration::from_millis(50), switch.expect_command()).await;
        assert!(early.is_err(), "second command written before first reply");
        switch
            .reply("200 result=1")
            .await;

        let line2 = switch
            .expect_command()
            .await;
        assert_ne!(line1, line2);
        switch
            .reply("200 result=2")
            .await;

        let first = first
            .await
            .unwrap()
            .unwrap();
        let second = second
            .await
            .unwrap()
            .unwrap();
        let (a_result, b_result) = if line1 == "NOOP A" {
            (1, 2)
        } else {
            (2, 1)
        };
        assert_eq!(first.result(), Some(a_result));
        assert_eq!(second.result(), Some(b_result));
    }

    #[tokio::test]
    async fn test_stray_reply_discarded() {
        let (session, mut switch) = connect().await;
        switch
            .reply("200 result=9")
            .await;

        tokio::time::timeout(SECOND, async {
            while session.stray_reply_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stray reply never counted");

        let (result, ()) = tokio::join!(session.execute(SECOND, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("200 result=0")
                .await;
        });
        assert_eq!(
            result
                .unwrap()
                .result(),
            Some(0)
        );
        assert_eq!(session.stray_reply_count(), 1);
    }

    #[tokio::test]
    async fn test_late_reply_taken_by_next_command() {
        let (session, mut switch) = connect().await;

        let (result, _) = tokio::join!(
            session.execute(Duration::from_millis(50), ["GET", "VARIABLE", "SLOW"]),
            switch.expect_command()
        );
        assert!(matches!(result, Err(AgiError::Timeout { .. })));

        let (result, ()) = tokio::join!(session.execute(SECOND, ["GET", "VARIABLE", "FAST"]), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "GET VARIABLE FAST"
            );
            switch
                .reply("200 result=1 (slow)\n200 result=1 (fast)")
                .await;
        });
        assert_eq!(
            result
                .unwrap()
                .value(),
            Some("slow")
        );

        tokio::time::timeout(SECOND, async {
            while session.stray_reply_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fast reply never discarded");
    }

    #[tokio::test]
    async fn test_non_success_keeps_session_usable() {
        let (session, mut switch) = connect().await;

        let (result, ()) = tokio::join!(session.execute(SECOND, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("511 result=-1")
                .await;
        });
        let err = result.unwrap_err();
        assert!(err.is_command_failure());
        assert_eq!(err.status(), Some(511));
        assert!(err
            .to_string()
            .contains("511 result=-1"));
        assert!(session.is_connected());

        let (result, ()) = tokio::join!(session.execute_raw(SECOND, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("510 result=")
                .await;
        });
        assert_eq!(
            result
                .unwrap()
                .status(),
            510
        );
    }

    #[tokio::test]
    async fn test_usage_block_reassembled() {
        let (session, mut switch) = connect().await;
        let (result, ()) = tokio::join!(session.execute_raw(SECOND, ["SAY", "NUMBER"]), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("520-Invalid command syntax.  Proper usage follows:\n Usage: SAY NUMBER <number> <escape digits>\n520 End of proper usage.")
                .await;
        });
        let response = result.unwrap();
        assert_eq!(response.status(), 520);
        assert!(response
            .body()
            .unwrap()
            .contains("Usage: SAY NUMBER"));
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_eof_while_waiting() {
        let (session, mut switch) = connect().await;
        let (result, ()) = tokio::join!(session.execute(Duration::ZERO, ["ANSWER"]), async {
            switch
                .expect_command()
                .await;
            drop(switch);
        });
        assert!(matches!(result, Err(AgiError::ConnectionClosed)));
        assert_eq!(
            session.status(),
            SessionStatus::Closed(DisconnectReason::ConnectionClosed)
        );
        assert!(matches!(
            session
                .execute(SECOND, ["ANSWER"])
                .await,
            Err(AgiError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_write_failure() {
        let (local_in, mut peer_in) = duplex(1024);
        peer_in
            .write_all(HANDSHAKE.as_bytes())
            .await
            .unwrap();
        let (local_out, peer_out) = duplex(1024);
        drop(peer_out);

        let session = AgiSession::new(local_in, local_out)
            .await
            .unwrap();
        let err = session
            .execute(SECOND, ["ANSWER"])
            .await
            .unwrap_err();
        assert!(matches!(err, AgiError::Io(_)));
        assert!(err.is_session_fatal());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_command_not_sent() {
        let (session, mut switch) = connect().await;
        let err = session
            .execute(SECOND, ["VERBOSE", "a\nHANGUP"])
            .await
            .unwrap_err();
        assert!(matches!(err, AgiError::ProtocolError { .. }));

        let (result, ()) = tokio::join!(session.execute(SECOND, ["ANSWER"]), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "ANSWER"
            );
            switch
                .reply("200 result=0")
                .await;
        });
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_convenience_commands() {
        let (session, mut switch) = connect().await;

        let (state, ()) = tokio::join!(session.channel_status(None), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "CHANNEL STATUS"
            );
            switch
                .reply("200 result=6")
                .await;
        });
        assert_eq!(state.unwrap(), ChannelState::Up);

        let (value, ()) = tokio::join!(session.get_variable("FOO"), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "GET VARIABLE FOO"
            );
            switch
                .reply("200 result=1 (bar baz)")
                .await;
        });
        assert_eq!(value.unwrap(), Some("bar baz".to_string()));

        let (value, ()) = tokio::join!(session.get_variable("UNSET"), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("200 result=0")
                .await;
        });
        assert_eq!(value.unwrap(), None);

        let (set, ()) = tokio::join!(session.set_variable("GREETING", "hello world"), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "SET VARIABLE GREETING \"hello world\""
            );
            switch
                .reply("200 result=1")
                .await;
        });
        assert!(set.is_ok());

        let (digit, ()) = tokio::join!(session.stream_file("demo-congrats", "123"), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "STREAM FILE demo-congrats 123 0"
            );
            switch
                .reply("200 result=50 endpos=4000")
                .await;
        });
        assert_eq!(digit.unwrap(), Some('2'));

        let (digit, ()) = tokio::join!(session.say_number(42, ""), async {
            assert_eq!(
                switch
                    .expect_command()
                    .await,
                "SAY NUMBER 42 \"\""
            );
            switch
                .reply("200 result=0")
                .await;
        });
        assert_eq!(digit.unwrap(), None);

        let (answered, ()) = tokio::join!(session.answer(), async {
            switch
                .expect_command()
                .await;
            switch
                .reply("200 result=-1")
                .await;
        });
        assert!(matches!(
            answered,
            Err(AgiError::UnexpectedResult { ref command, .. }) if command == "ANSWER"
        ));
    }

    #[tokio::test]
    async fn test_close() {
        let (session, mut switch) = connect().await;
        session
            .close()
            .await
            .unwrap();
        assert!(session.is_closed());
        assert_eq!(
            session.status(),
            SessionStatus::Closed(DisconnectReason::ClientRequested)
        );
        assert!(matches!(
            session
                .execute(SECOND, ["ANSWER"])
                .await,
            Err(AgiError::NotConnected)
        ));
        assert_eq!(
            switch
                .lines
                .next_line()
                .await
                .unwrap(),
            None
        );
        // Second close is a no-op.
        session
            .close()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_eagi_stream_taken_once() {
        let (local, mut peer) = duplex(1024);
        peer.write_all(HANDSHAKE.as_bytes())
            .await
            .unwrap();
        let (read_half, write_half) = split(local);
        let audio: &'static [u8] = b"\x01\x02\x03\x04";
        let session = AgiSession::with_eagi(read_half, write_half, audio, AgiSessionOptions::default())
            .await
            .unwrap();

        let mut eagi = session
            .take_eagi()
            .unwrap();
        let mut buf = Vec::new();
        eagi.read_to_end(&mut buf)
            .await
            .unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert!(session
            .take_eagi()
            .is_none());
    }
}
