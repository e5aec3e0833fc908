//! AGI protocol parsing: handshake lines and reply lines

use crate::{
    command::AgiResponse,
    constants::{HANGUP_PREFIX, MAX_LINE_SIZE, RESULT_PREFIX},
    error::{AgiError, AgiResult},
};

/// Split a handshake line on its first colon into a trimmed key/value pair.
///
/// Lines without a colon carry no variable and yield `None`.
pub fn parse_variable_line(line: &str) -> Option<(String, String)> {
    let colon_pos = line.find(':')?;
    let key = line[..colon_pos]
        .trim()
        .to_string();
    let value = line[colon_pos + 1..]
        .trim()
        .to_string();
    Some((key, value))
}

/// Parse one reply line: `<3 digits> result=<token>[ (<value>)][ <trailing>]`.
///
/// The result token is `-?[A-Za-z0-9]*`. A token that is not an integer is
/// not an error; it only leaves [`AgiResponse::result`] unset.
pub fn parse_reply_line(line: &str) -> AgiResult<AgiResponse> {
    let malformed = || AgiError::MalformedReply {
        line: line.to_string(),
    };

    let status = status_prefix(line, |b| b.is_ascii_whitespace()).ok_or_else(malformed)?;

    let rest = line[4..]
        .strip_prefix(RESULT_PREFIX)
        .ok_or_else(malformed)?;

    let sign = usize::from(rest.starts_with('-'));
    let token_len = sign
        + rest[sign..]
            .bytes()
            .take_while(u8::is_ascii_alphanumeric)
            .count();
    let (token, remainder) = rest.split_at(token_len);

    if remainder
        .bytes()
        .next()
        .is_some_and(|b| !b.is_ascii_whitespace())
    {
        return Err(malformed());
    }

    let (value, trailing) = split_value(remainder.trim());

    Ok(AgiResponse::from_parts(
        status,
        token.to_string(),
        value,
        trailing,
        line.to_string(),
    ))
}

/// Three leading digits followed by a separator accepted by `separator`.
fn status_prefix(line: &str, separator: impl Fn(u8) -> bool) -> Option<u16> {
    let bytes = line.as_bytes();
    if bytes.len() < 4
        || !bytes[..3]
            .iter()
            .all(u8::is_ascii_digit)
        || !separator(bytes[3])
    {
        return None;
    }
    line[..3]
        .parse()
        .ok()
}

/// Split what follows the result token into the parenthesized value and
/// any trailing `key=value` text.
///
/// A closing parenthesis only ends the value when followed by whitespace or
/// the end of the line, so values such as `(foo(1))` survive. Unparenthesized
/// text is kept whole as the value.
fn split_value(remainder: &str) -> (Option<String>, Option<String>) {
    if remainder.is_empty() {
        return (None, None);
    }

    let Some(inner) = remainder.strip_prefix('(') else {
        return (Some(remainder.to_string()), None);
    };

    let close = inner
        .char_indices()
        .find(|(pos, c)| {
            *c == ')'
                && inner[pos + 1..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(pos, _)| pos);

    match close {
        Some(pos) => {
            let trailing = inner[pos + 1..].trim();
            (
                Some(inner[..pos].to_string()),
                (!trailing.is_empty()).then(|| trailing.to_string()),
            )
        }
        None => (Some(inner.to_string()), None),
    }
}

/// What one inbound line amounts to once framing is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete reply to the command in flight.
    Reply(AgiResponse),
    /// Out-of-band `HANGUP` notification.
    Hangup,
    /// Blank line or the inside of a multi-line block.
    Skip,
}

/// Multi-line block being collected, e.g. the `520-` usage text.
#[derive(Debug)]
struct Block {
    status: u16,
    lines: Vec<String>,
    raw: Vec<String>,
    bytes: usize,
}

/// Stateful reply framer.
///
/// Most replies are one line. Asterisk also emits blocks opened by
/// `NNN-text` and closed by a line starting with `NNN ` (the syntax-error
/// usage text); those are collected into a single [`AgiResponse`]. An open
/// block holds at most `max_block` bytes.
#[derive(Debug)]
pub struct ReplyAssembler {
    block: Option<Block>,
    max_block: usize,
}

impl Default for ReplyAssembler {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_SIZE)
    }
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_block: usize) -> Self {
        Self {
            block: None,
            max_block,
        }
    }

    /// Feed one line (terminator already stripped).
    pub fn feed(&mut self, line: String) -> AgiResult<Frame> {
        if let Some(mut block) = self
            .block
            .take()
        {
            let closes = status_prefix(&line, |b| b == b' ') == Some(block.status)
                || line == block.status.to_string();
            block.bytes += line.len() + 1;
            if block.bytes > self.max_block {
                return Err(AgiError::framing_error(format!(
                    "{} block exceeds {} bytes",
                    block.status, self.max_block
                )));
            }
            if !closes {
                block
                    .lines
                    .push(line.clone());
                block
                    .raw
                    .push(line);
                self.block = Some(block);
                return Ok(Frame::Skip);
            }

            let text = line
                .get(4..)
                .unwrap_or("")
                .to_string();
            block
                .lines
                .push(text);
            block
                .raw
                .push(line);
            return Ok(Frame::Reply(AgiResponse::from_block(
                block.status,
                block.lines,
                block
                    .raw
                    .join("\n"),
            )));
        }

        if line.is_empty() {
            return Ok(Frame::Skip);
        }

        if line.starts_with(HANGUP_PREFIX) {
            return Ok(Frame::Hangup);
        }

        if let Some(status) = status_prefix(&line, |b| b == b'-') {
            self.block = Some(Block {
                status,
                bytes: line.len() + 1,
                lines: vec![line[4..].to_string()],
                raw: vec![line],
            });
            return Ok(Frame::Skip);
        }

        parse_reply_line(&line).map(Frame::Reply)
    }

    /// Whether a multi-line block is still open.
    pub fn in_block(&self) -> bool {
        self.block
            .is_some()
    }
}
