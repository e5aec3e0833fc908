//! Protocol constants and configuration values

/// Default FastAGI port Asterisk connects to
pub const DEFAULT_FASTAGI_PORT: u16 = 4573;

/// Default FastAGI listening address
pub const DEFAULT_FASTAGI_ADDR: &str = "localhost:4573";

/// Status code of an accepted command
pub const STATUS_OK: u16 = 200;
/// Asterisk did not recognise the command
pub const STATUS_INVALID: u16 = 510;
/// Command cannot run on a hung-up channel
pub const STATUS_DEAD_CHANNEL: u16 = 511;
/// Command syntax error, followed by a usage block
pub const STATUS_END_USAGE: u16 = 520;

/// Protocol line terminator
pub const LINE_TERMINATOR: &str = "\n";

/// Prefix of the out-of-band hangup notification
pub const HANGUP_PREFIX: &str = "HANGUP";

/// Literal that introduces the result token of a reply line
pub const RESULT_PREFIX: &str = "result=";

/// Maximum single line length (64KB). Longer lines mean the peer is not
/// speaking AGI, so the session is treated as desynchronised.
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Read buffer capacity for the line reader
pub const READ_BUF_SIZE: usize = 8 * 1024;

/// Timeout for ANSWER
pub const ANSWER_TIMEOUT_MS: u64 = 30_000;
/// Timeout for HANGUP
pub const HANGUP_TIMEOUT_MS: u64 = 1_000;
/// Timeout for CHANNEL STATUS, GET VARIABLE and SET VARIABLE
pub const VARIABLE_TIMEOUT_MS: u64 = 5_000;
/// Timeout for STREAM FILE
pub const STREAM_FILE_TIMEOUT_MS: u64 = 60_000;

/// Default `RECORD FILE` maximum duration in milliseconds (5 minutes)
pub const DEFAULT_RECORD_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default Asterisk `SAY DATETIME` format
pub const DEFAULT_SAY_DATETIME_FORMAT: &str = "ABdY 'digits/at' IMp";

/// Prompt played by `GET DATA` when none is given
pub const DEFAULT_GET_DATA_PROMPT: &str = "silence/1";

/// Placeholder AGI expects for an empty argument
pub const EMPTY_ARG: &str = "\"\"";

/// File descriptor path Asterisk exposes EAGI audio on
pub const EAGI_AUDIO_PATH: &str = "/dev/fd/3";
