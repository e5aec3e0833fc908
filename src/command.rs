//! Command framing and response handling

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    constants::{
        ANSWER_TIMEOUT_MS, DEFAULT_GET_DATA_PROMPT, DEFAULT_RECORD_TIMEOUT_MS,
        DEFAULT_SAY_DATETIME_FORMAT, EMPTY_ARG, HANGUP_TIMEOUT_MS, STATUS_OK,
        STREAM_FILE_TIMEOUT_MS, VARIABLE_TIMEOUT_MS,
    },
    error::{AgiError, AgiResult},
};

/// Validate that a user-provided string contains no newline characters.
///
/// AGI commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> AgiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AgiError::ProtocolError {
            message: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}

/// Join command tokens with single spaces into one command line (without
/// the terminator).
///
/// Every token is joined literally, so empty tokens still contribute a
/// separator. A line that comes out empty is rejected.
pub fn command_line<I, S>(tokens: I) -> AgiResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, token) in tokens
        .into_iter()
        .enumerate()
    {
        let token = token.as_ref();
        validate_no_newlines(token, "command token")?;
        if i > 0 {
            line.push(' ');
        }
        line.push_str(token);
    }
    if line.is_empty() {
        return Err(AgiError::protocol_error("empty command"));
    }
    Ok(line)
}

/// Quote an argument so Asterisk reads it as a single token.
fn quote_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Escape digits, with the `""` placeholder AGI needs for an empty set.
fn escape_arg(escape_digits: &str) -> &str {
    if escape_digits.is_empty() {
        EMPTY_ARG
    } else {
        escape_digits
    }
}

/// Seconds since the Unix epoch, negative before it.
pub fn epoch_seconds(when: SystemTime) -> i64 {
    match when.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e
            .duration()
            .as_secs() as i64),
    }
}

/// Parsed reply to one AGI command.
///
/// `result_string` is always the raw result token; `result` is that token
/// as an integer when it is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiResponse {
    status: u16,
    result: Option<i32>,
    result_string: String,
    value: Option<String>,
    trailing: Option<String>,
    body: Option<String>,
    raw: String,
}

impl AgiResponse {
    pub(crate) fn from_parts(
        status: u16,
        result_string: String,
        value: Option<String>,
        trailing: Option<String>,
        raw: String,
    ) -> Self {
        Self {
            status,
            result: result_string
                .parse()
                .ok(),
            result_string,
            value,
            trailing,
            body: None,
            raw,
        }
    }

    pub(crate) fn from_block(status: u16, lines: Vec<String>, raw: String) -> Self {
        Self {
            status,
            result: None,
            result_string: String::new(),
            value: None,
            trailing: None,
            body: Some(lines.join("\n")),
            raw,
        }
    }

    /// Three-digit status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// `true` if the status is 200.
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Result token as an integer, if it is one.
    pub fn result(&self) -> Option<i32> {
        self.result
    }

    /// Result token verbatim.
    pub fn result_string(&self) -> &str {
        &self.result_string
    }

    /// Parenthesized payload with the parentheses removed.
    pub fn value(&self) -> Option<&str> {
        self.value
            .as_deref()
    }

    /// Text of a multi-line block reply, lines joined with `\n` and the
    /// status prefixes removed.
    pub fn body(&self) -> Option<&str> {
        self.body
            .as_deref()
    }

    /// The reply exactly as received (block lines joined with `\n`).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Look up a `key=value` token following the result, e.g. `endpos`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        [self.trailing.as_deref(), self.value.as_deref()]
            .into_iter()
            .flatten()
            .flat_map(str::split_whitespace)
            .find_map(|token| {
                token
                    .strip_prefix(key)?
                    .strip_prefix('=')
            })
    }

    /// DTMF digit encoded as its ASCII code in the result.
    ///
    /// Commands that can be interrupted by a key press return `0` when none
    /// was pressed and `-1` on failure; both yield `None`.
    pub fn digit(&self) -> Option<char> {
        let code = u32::try_from(self.result?).ok()?;
        char::from_u32(code).filter(|c| *c != '\0' && !c.is_control())
    }

    /// Convert to result based on the status code.
    ///
    /// ```
    /// # use asterisk_agi_tokio::protocol::parse_reply_line;
    /// let resp = parse_reply_line("511 result=-1").unwrap();
    /// assert!(resp.into_result().is_err());
    /// ```
    pub fn into_result(self) -> AgiResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AgiError::CommandFailed {
                status: self.status,
                reply: self.raw,
            })
        }
    }
}

impl fmt::Display for AgiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self
            .body
            .is_some()
        {
            return f.write_str(&self.raw);
        }
        write!(f, "{} result={}", self.status, self.result_string)?;
        if let Some(value) = &self.value {
            write!(f, " ({})", value)?;
        }
        if let Some(trailing) = &self.trailing {
            write!(f, " {}", trailing)?;
        }
        Ok(())
    }
}

/// Options for `RECORD FILE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOptions {
    /// Audio format of the recording. Default: `wav`.
    pub format: String,
    /// Digits that end the recording. Default: `#`.
    pub escape_digits: String,
    /// Maximum recording length. Default: 5 minutes.
    pub timeout: Duration,
    /// Silence that ends the recording, whole seconds. Zero disables.
    pub silence: Duration,
    /// Play a beep before recording.
    pub beep: bool,
    /// Samples to skip at the start of the recording.
    pub offset: u64,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            format: "wav".to_string(),
            escape_digits: "#".to_string(),
            timeout: Duration::from_millis(DEFAULT_RECORD_TIMEOUT_MS),
            silence: Duration::ZERO,
            beep: false,
            offset: 0,
        }
    }
}

/// Typed AGI commands.
///
/// Each renders to a single command line; the session appends the
/// terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AgiCommand {
    /// Answer the channel
    Answer,
    /// Hang up the current channel, or the named one
    Hangup { channel: Option<String> },
    /// Query the state of the current channel, or the named one
    ChannelStatus { channel: Option<String> },
    /// Run a dialplan application
    Exec {
        application: String,
        options: Option<String>,
    },
    /// Read a channel variable
    GetVariable { name: String },
    /// Set a channel variable
    SetVariable { name: String, value: String },
    /// Play a prompt and collect DTMF digits
    GetData {
        prompt: Option<String>,
        timeout: Option<Duration>,
        max_digits: Option<u32>,
    },
    /// Play an audio file, interruptible by escape digits
    StreamFile {
        file: String,
        escape_digits: String,
        offset: u64,
    },
    /// Record audio to a file
    RecordFile {
        file: String,
        options: RecordOptions,
    },
    /// Spell out a string character by character
    SayAlpha { text: String, escape_digits: String },
    /// Say a digit string
    SayDigits {
        digits: String,
        escape_digits: String,
    },
    /// Say a number
    SayNumber {
        number: String,
        escape_digits: String,
    },
    /// Say a string phonetically
    SayPhonetic { text: String, escape_digits: String },
    /// Say the date part of a Unix timestamp
    SayDate { epoch: i64, escape_digits: String },
    /// Say the time part of a Unix timestamp
    SayTime { epoch: i64, escape_digits: String },
    /// Say a Unix timestamp with a voicemail.conf style format
    SayDateTime {
        epoch: i64,
        escape_digits: String,
        format: Option<String>,
        timezone: Option<String>,
    },
    /// Log a message to the Asterisk verbose log
    Verbose { message: String, level: u8 },
    /// Wait for one DTMF digit; `None` waits forever
    WaitForDigit { timeout: Option<Duration> },
}

impl AgiCommand {
    /// Timeout used when the command is sent through
    /// [`AgiSession::send_command`](crate::AgiSession::send_command).
    /// Zero waits indefinitely.
    pub fn default_timeout(&self) -> Duration {
        let ms = match self {
            AgiCommand::Answer => ANSWER_TIMEOUT_MS,
            AgiCommand::Hangup { .. } => HANGUP_TIMEOUT_MS,
            AgiCommand::ChannelStatus { .. }
            | AgiCommand::GetVariable { .. }
            | AgiCommand::SetVariable { .. } => VARIABLE_TIMEOUT_MS,
            AgiCommand::StreamFile { .. } => STREAM_FILE_TIMEOUT_MS,
            _ => 0,
        };
        Duration::from_millis(ms)
    }

    /// Validate all user-supplied fields, then render the command line.
    pub fn to_wire_format(&self) -> AgiResult<String> {
        match self {
            AgiCommand::Answer => command_line(["ANSWER"]),
            AgiCommand::Hangup { channel } => match channel {
                Some(c) => command_line(["HANGUP", c.as_str()]),
                None => command_line(["HANGUP"]),
            },
            AgiCommand::ChannelStatus { channel } => match channel {
                Some(c) => command_line(["CHANNEL", "STATUS", c.as_str()]),
                None => command_line(["CHANNEL", "STATUS"]),
            },
            AgiCommand::Exec {
                application,
                options,
            } => match options {
                Some(o) => command_line(["EXEC", application.as_str(), o.as_str()]),
                None => command_line(["EXEC", application.as_str()]),
            },
            AgiCommand::GetVariable { name } => command_line(["GET", "VARIABLE", name.as_str()]),
            AgiCommand::SetVariable { name, value } => {
                validate_no_newlines(value, "variable value")?;
                command_line(["SET", "VARIABLE", name.as_str(), quote_arg(value).as_str()])
            }
            AgiCommand::GetData {
                prompt,
                timeout,
                max_digits,
            } => {
                let prompt = prompt
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_GET_DATA_PROMPT);
                let mut tokens = vec![
                    "GET".to_string(),
                    "DATA".to_string(),
                    prompt.to_string(),
                ];
                if timeout.is_some() || max_digits.is_some() {
                    tokens.push(
                        timeout
                            .unwrap_or_default()
                            .as_millis()
                            .to_string(),
                    );
                }
                if let Some(max) = max_digits {
                    tokens.push(max.to_string());
                }
                command_line(tokens)
            }
            AgiCommand::StreamFile {
                file,
                escape_digits,
                offset,
            } => command_line([
                "STREAM",
                "FILE",
                file.as_str(),
                escape_arg(escape_digits),
                offset
                    .to_string()
                    .as_str(),
            ]),
            AgiCommand::RecordFile { file, options } => {
                let mut tokens = vec![
                    "RECORD".to_string(),
                    "FILE".to_string(),
                    file.clone(),
                    options
                        .format
                        .clone(),
                    escape_arg(&options.escape_digits).to_string(),
                    options
                        .timeout
                        .as_millis()
                        .to_string(),
                ];
                if options.offset > 0 {
                    tokens.push(
                        options
                            .offset
                            .to_string(),
                    );
                }
                if options.beep {
                    tokens.push("BEEP".to_string());
                }
                let silence = options
                    .silence
                    .as_secs();
                if silence > 0 {
                    tokens.push(format!("s={}", silence));
                }
                command_line(tokens)
            }
            AgiCommand::SayAlpha {
                text,
                escape_digits,
            } => command_line(["SAY", "ALPHA", text.as_str(), escape_arg(escape_digits)]),
            AgiCommand::SayDigits {
                digits,
                escape_digits,
            } => command_line(["SAY", "DIGITS", digits.as_str(), escape_arg(escape_digits)]),
            AgiCommand::SayNumber {
                number,
                escape_digits,
            } => command_line(["SAY", "NUMBER", number.as_str(), escape_arg(escape_digits)]),
            AgiCommand::SayPhonetic {
                text,
                escape_digits,
            } => command_line(["SAY", "PHONETIC", text.as_str(), escape_arg(escape_digits)]),
            AgiCommand::SayDate {
                epoch,
                escape_digits,
            } => command_line([
                "SAY",
                "DATE",
                epoch
                    .to_string()
                    .as_str(),
                escape_arg(escape_digits),
            ]),
            AgiCommand::SayTime {
                epoch,
                escape_digits,
            } => command_line([
                "SAY",
                "TIME",
                epoch
                    .to_string()
                    .as_str(),
                escape_arg(escape_digits),
            ]),
            AgiCommand::SayDateTime {
                epoch,
                escape_digits,
                format,
                timezone,
            } => {
                let format = format
                    .as_deref()
                    .filter(|f| !f.is_empty())
                    .unwrap_or(DEFAULT_SAY_DATETIME_FORMAT);
                validate_no_newlines(format, "datetime format")?;
                let mut tokens = vec![
                    "SAY".to_string(),
                    "DATETIME".to_string(),
                    epoch.to_string(),
                    escape_arg(escape_digits).to_string(),
                    quote_arg(format),
                ];
                if let Some(tz) = timezone {
                    tokens.push(tz.clone());
                }
                command_line(tokens)
            }
            AgiCommand::Verbose { message, level } => {
                validate_no_newlines(message, "verbose message")?;
                command_line([
                    "VERBOSE",
                    quote_arg(message).as_str(),
                    level
                        .to_string()
                        .as_str(),
                ])
            }
            AgiCommand::WaitForDigit { timeout } => {
                let ms = match timeout {
                    Some(t) => t
                        .as_millis()
                        .to_string(),
                    None => "-1".to_string(),
                };
                command_line(["WAIT", "FOR", "DIGIT", ms.as_str()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_reply_line;

    #[test]
    fn test_command_line_joins_tokens() {
        assert_eq!(
            command_line(["GET VARIABLE", "MYVAR"]).unwrap(),
            "GET VARIABLE MYVAR"
        );
        assert_eq!(command_line(vec!["ANSWER".to_string()]).unwrap(), "ANSWER");
    }

    #[test]
    fn test_command_line_keeps_empty_tokens() {
        assert_eq!(command_line(["", "X"]).unwrap(), " X");
        assert_eq!(command_line(["EXEC", "", "arg"]).unwrap(), "EXEC  arg");
        assert!(command_line([""]).is_err());
    }

    #[test]
    fn test_command_line_rejects_newlines_and_empty() {
        assert!(command_line(["ANSWER\nHANGUP"]).is_err());
        assert!(command_line(["SET VARIABLE", "x", "a\rb"]).is_err());
        assert!(command_line(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(
            AgiCommand::Answer
                .to_wire_format()
                .unwrap(),
            "ANSWER"
        );
        assert_eq!(
            AgiCommand::Hangup { channel: None }
                .to_wire_format()
                .unwrap(),
            "HANGUP"
        );
        assert_eq!(
            AgiCommand::ChannelStatus {
                channel: Some("SIP/1234-00000001".into())
            }
            .to_wire_format()
            .unwrap(),
            "CHANNEL STATUS SIP/1234-00000001"
        );
        assert_eq!(
            AgiCommand::GetVariable {
                name: "MYVAR".into()
            }
            .to_wire_format()
            .unwrap(),
            "GET VARIABLE MYVAR"
        );
    }

    #[test]
    fn test_set_variable_quotes_value() {
        let cmd = AgiCommand::SetVariable {
            name: "GREETING".into(),
            value: r#"say "hi""#.into(),
        };
        assert_eq!(
            cmd.to_wire_format()
                .unwrap(),
            r#"SET VARIABLE GREETING "say \"hi\"""#
        );
    }

    #[test]
    fn test_stream_file_empty_escape_digits() {
        let cmd = AgiCommand::StreamFile {
            file: "hello-world".into(),
            escape_digits: String::new(),
            offset: 0,
        };
        assert_eq!(
            cmd.to_wire_format()
                .unwrap(),
            r#"STREAM FILE hello-world "" 0"#
        );
        assert_eq!(cmd.default_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_get_data_defaults() {
        let cmd = AgiCommand::GetData {
            prompt: None,
            timeout: Some(Duration::from_secs(5)),
            max_digits: Some(4),
        };
        assert_eq!(
            cmd.to_wire_format()
                .unwrap(),
            "GET DATA silence/1 5000 4"
        );
        assert_eq!(cmd.default_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_record_file_options() {
        let cmd = AgiCommand::RecordFile {
            file: "/tmp/msg".into(),
            options: RecordOptions::default(),
        };
        assert_eq!(
            cmd.to_wire_format()
                .unwrap(),
            "RECORD FILE /tmp/msg wav # 300000"
        );

        let cmd = AgiCommand::RecordFile {
            file: "/tmp/msg".into(),
            options: RecordOptions {
                format: "gsm".into(),
                escape_digits: "*#".into(),
                timeout: Duration::from_secs(10),
                silence: Duration::from_millis(3500),
                beep: true,
                offset: 800,
            },
        };
        assert_eq!(
            cmd.to_wire_format()
                .unwrap(),
            "RECORD FILE /tmp/msg gsm *# 10000 800 BEEP s=3"
        );
    }

    #[test]
    fn test_say_commands() {
        assert_eq!(
            AgiCommand::SayDigits {
                digits: "1234".into(),
                escape_digits: "#".into()
            }
            .to_wire_format()
            .unwrap(),
            "SAY DIGITS 1234 #"
        );
        assert_eq!(
            AgiCommand::SayPhonetic {
                text: "abc".into(),
                escape_digits: String::new()
            }
            .to_wire_format()
            .unwrap(),
            r#"SAY PHONETIC abc """#
        );
        assert_eq!(
            AgiCommand::SayDateTime {
                epoch: 1_700_000_000,
                escape_digits: String::new(),
                format: None,
                timezone: Some("UTC".into()),
            }
            .to_wire_format()
            .unwrap(),
            r#"SAY DATETIME 1700000000 "" "ABdY 'digits/at' IMp" UTC"#
        );
    }

    #[test]
    fn test_verbose_and_wait_for_digit() {
        assert_eq!(
            AgiCommand::Verbose {
                message: "call started".into(),
                level: 3
            }
            .to_wire_format()
            .unwrap(),
            r#"VERBOSE "call started" 3"#
        );
        assert!(AgiCommand::Verbose {
            message: "two\nlines".into(),
            level: 1
        }
        .to_wire_format()
        .is_err());
        assert_eq!(
            AgiCommand::WaitForDigit { timeout: None }
                .to_wire_format()
                .unwrap(),
            "WAIT FOR DIGIT -1"
        );
        assert_eq!(
            AgiCommand::WaitForDigit {
                timeout: Some(Duration::from_millis(2500))
            }
            .to_wire_format()
            .unwrap(),
            "WAIT FOR DIGIT 2500"
        );
    }

    #[test]
    fn test_epoch_seconds() {
        assert_eq!(epoch_seconds(UNIX_EPOCH + Duration::from_secs(42)), 42);
        assert_eq!(epoch_seconds(UNIX_EPOCH - Duration::from_secs(42)), -42);
    }

    #[test]
    fn test_response_digit() {
        let pressed = parse_reply_line("200 result=35").unwrap();
        assert_eq!(pressed.digit(), Some('#'));
        let none = parse_reply_line("200 result=0").unwrap();
        assert_eq!(none.digit(), None);
        let failed = parse_reply_line("200 result=-1").unwrap();
        assert_eq!(failed.digit(), None);
    }

    #[test]
    fn test_into_result() {
        assert!(parse_reply_line("200 result=1")
            .unwrap()
            .into_result()
            .is_ok());

        match parse_reply_line("510 result=-1")
            .unwrap()
            .into_result()
        {
            Err(AgiError::CommandFailed { status, reply }) => {
                assert_eq!(status, 510);
                assert_eq!(reply, "510 result=-1");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }
}
