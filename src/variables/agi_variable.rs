//! Typed names for the `agi_*` handshake variables.

/// Error returned when parsing an unrecognized AGI variable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAgiVariableError(pub String);

impl std::fmt::Display for ParseAgiVariableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AGI variable: {}", self.0)
    }
}

impl std::error::Error for ParseAgiVariableError {}

define_wire_enum! {
    error_type: ParseAgiVariableError,
    /// Variables Asterisk sends in the handshake block.
    ///
    /// Use with [`AgiVariables::get()`](super::AgiVariables::get) or
    /// [`AgiSession::variable()`](crate::AgiSession::variable) for typed
    /// lookups. Script arguments (`agi_arg_1`, ...) are numbered and are
    /// read with [`AgiVariables::arguments()`](super::AgiVariables::arguments).
    pub enum AgiVariable {
        Request => "agi_request",
        Channel => "agi_channel",
        Language => "agi_language",
        Type => "agi_type",
        UniqueId => "agi_uniqueid",
        Version => "agi_version",
        CallerId => "agi_callerid",
        CallerIdName => "agi_calleridname",
        CallingPres => "agi_callingpres",
        CallingAni2 => "agi_callingani2",
        CallingTon => "agi_callington",
        CallingTns => "agi_callingtns",
        Dnid => "agi_dnid",
        Rdnis => "agi_rdnis",
        Context => "agi_context",
        Extension => "agi_extension",
        Priority => "agi_priority",
        Enhanced => "agi_enhanced",
        AccountCode => "agi_accountcode",
        ThreadId => "agi_threadid",
        Network => "agi_network",
        NetworkScript => "agi_network_script",
    }
}
