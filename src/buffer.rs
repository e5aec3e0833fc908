//! Bounded line reader for AGI streams

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::{
    constants::READ_BUF_SIZE,
    error::{AgiError, AgiResult},
};

/// Reads `\n`-terminated lines, stripping a trailing `\r`.
///
/// Bytes that are not valid UTF-8 (Latin-1 caller names, for one) are
/// replaced with U+FFFD rather than rejected.
///
/// Unlike `read_line`, the accumulated line is bounded so a peer that never
/// sends a newline cannot grow memory without limit. The reader is only ever
/// driven by one task, so partial lines are never lost to cancellation.
pub struct LineReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
    max_line: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUF_SIZE, reader),
            line: Vec::new(),
            max_line,
        }
    }

    /// Longest line accepted.
    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Next line without its terminator, or `None` at end of stream.
    ///
    /// A final line without a terminator is returned as-is.
    pub async fn next_line(&mut self) -> AgiResult<Option<String>> {
        self.line
            .clear();

        loop {
            let available = self
                .inner
                .fill_buf()
                .await
                .map_err(AgiError::Io)?;

            if available.is_empty() {
                if self
                    .line
                    .is_empty()
                {
                    return Ok(None);
                }
                break;
            }

            let found = available
                .iter()
                .position(|b| *b == b'\n');
            let take = found.unwrap_or(available.len());
            self.line
                .extend_from_slice(&available[..take]);
            self.inner
                .consume(found.map_or(take, |pos| pos + 1));

            if self.line.len() > self.max_line {
                return Err(AgiError::framing_error(format!(
                    "Line exceeds {} bytes without a terminator",
                    self.max_line
                )));
            }

            if found.is_some() {
                break;
            }
        }

        if self.line.last() == Some(&b'\r') {
            self.line
                .pop();
        }

        let bytes = std::mem::take(&mut self.line);
        Ok(Some(match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }))
    }
}
