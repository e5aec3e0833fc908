//! Channel state reported by `CHANNEL STATUS`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Channel state from Asterisk's `ast_channel_state`, returned as the
/// integer result of `CHANNEL STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[repr(u8)]
pub enum ChannelState {
    /// Channel is down and available
    Down = 0,
    /// Channel is down but reserved
    Reserved = 1,
    /// Channel is off hook
    OffHook = 2,
    /// Digits have been dialed
    Dialing = 3,
    /// Line is ringing
    Ring = 4,
    /// Remote end is ringing (ringback)
    Ringing = 5,
    /// Line is up
    Up = 6,
    /// Line is busy
    Busy = 7,
    /// Digits have been dialed while off hook
    DialingOffHook = 8,
    /// Incoming call detected, waiting for ring
    PreRing = 9,
}

impl ChannelState {
    /// Parse from the integer `CHANNEL STATUS` result.
    pub fn from_number(n: i32) -> Option<Self> {
        match n {
            0 => Some(Self::Down),
            1 => Some(Self::Reserved),
            2 => Some(Self::OffHook),
            3 => Some(Self::Dialing),
            4 => Some(Self::Ring),
            5 => Some(Self::Ringing),
            6 => Some(Self::Up),
            7 => Some(Self::Busy),
            8 => Some(Self::DialingOffHook),
            9 => Some(Self::PreRing),
            _ => None,
        }
    }

    /// Integer discriminant matching `ast_channel_state`.
    pub fn as_number(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Down => "Down",
            Self::Reserved => "Rsrvd",
            Self::OffHook => "OffHook",
            Self::Dialing => "Dialing",
            Self::Ring => "Ring",
            Self::Ringing => "Ringing",
            Self::Up => "Up",
            Self::Busy => "Busy",
            Self::DialingOffHook => "Dialing Offhook",
            Self::PreRing => "Pre-ring",
        };
        f.write_str(name)
    }
}

/// Error returned when parsing an invalid channel state string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseChannelStateError(pub String);

impl fmt::Display for ParseChannelStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown channel state: {}", self.0)
    }
}

impl std::error::Error for ParseChannelStateError {}

impl FromStr for ChannelState {
    type Err = ParseChannelStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .to_lowercase()
            .as_str()
        {
            "down" => Ok(Self::Down),
            "rsrvd" | "reserved" => Ok(Self::Reserved),
            "offhook" => Ok(Self::OffHook),
            "dialing" => Ok(Self::Dialing),
            "ring" => Ok(Self::Ring),
            "ringing" => Ok(Self::Ringing),
            "up" => Ok(Self::Up),
            "busy" => Ok(Self::Busy),
            "dialing offhook" => Ok(Self::DialingOffHook),
            "pre-ring" => Ok(Self::PreRing),
            _ => Err(ParseChannelStateError(s.to_string())),
        }
    }
}
