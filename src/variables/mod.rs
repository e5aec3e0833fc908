//! Handshake variables: the `agi_*` block Asterisk sends before any command.

mod agi_variable;
mod agi_variables;

pub use agi_variable::{AgiVariable, ParseAgiVariableError};
pub use agi_variables::AgiVariables;
