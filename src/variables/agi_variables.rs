//! Handshake variable map.

use std::collections::HashMap;

use super::AgiVariable;

const ARG_PREFIX: &str = "agi_arg_";

/// Variables received in the AGI handshake, keyed by name.
///
/// Keys are stored exactly as sent. When a key repeats, the last value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgiVariables {
    vars: HashMap<String, String>,
}

impl AgiVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a variable by typed name or raw string key.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.vars
            .get(key.as_ref())
            .map(|s| s.as_str())
    }

    pub(crate) fn insert(&mut self, key: String, value: String) {
        self.vars
            .insert(key, value);
    }

    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.vars
            .contains_key(key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.vars
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars
            .is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `agi_request`: script path or FastAGI URL.
    pub fn request(&self) -> Option<&str> {
        self.get(AgiVariable::Request)
    }

    /// `agi_channel`
    pub fn channel(&self) -> Option<&str> {
        self.get(AgiVariable::Channel)
    }

    /// `agi_language`
    pub fn language(&self) -> Option<&str> {
        self.get(AgiVariable::Language)
    }

    /// `agi_uniqueid`
    pub fn unique_id(&self) -> Option<&str> {
        self.get(AgiVariable::UniqueId)
    }

    /// `agi_callerid`
    pub fn caller_id(&self) -> Option<&str> {
        self.get(AgiVariable::CallerId)
    }

    /// `agi_context`
    pub fn context(&self) -> Option<&str> {
        self.get(AgiVariable::Context)
    }

    /// `agi_extension`
    pub fn extension(&self) -> Option<&str> {
        self.get(AgiVariable::Extension)
    }

    /// `agi_priority` as an integer, if it parses.
    pub fn priority(&self) -> Option<u32> {
        self.get(AgiVariable::Priority)?
            .parse()
            .ok()
    }

    /// Whether Asterisk launched the script as EAGI (`agi_enhanced: 1.0`).
    pub fn is_enhanced(&self) -> bool {
        self.get(AgiVariable::Enhanced)
            .and_then(|v| {
                v.parse::<f64>()
                    .ok()
            })
            .is_some_and(|v| v > 0.0)
    }

    /// Script arguments from `agi_arg_1`, `agi_arg_2`, ... in numeric order.
    ///
    /// Keys whose suffix is not a number are ignored.
    pub fn arguments(&self) -> Vec<&str> {
        let mut args: Vec<(u32, &str)> = self
            .vars
            .iter()
            .filter_map(|(k, v)| {
                let n = k
                    .strip_prefix(ARG_PREFIX)?
                    .parse()
                    .ok()?;
                Some((n, v.as_str()))
            })
            .collect();
        args.sort_by_key(|(n, _)| *n);
        args.into_iter()
            .map(|(_, v)| v)
            .collect()
    }
}

impl FromIterator<(String, String)> for AgiVariables {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut vars = Self::new();
        for (k, v) in iter {
            vars.insert(k, v);
        }
        vars
    }
}
