use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rule selecting which registered callback answers a call.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvokePolicy {
    /// Exactly one callback may be registered under the name.
    #[default]
    Single,
    /// Oldest surviving registration answers.
    First,
    /// Most recently (re-)registered callback answers.
    Last,
    /// Uniformly random choice among all registrations.
    Random,
}

impl InvokePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::First => "first",
            Self::Last => "last",
            Self::Random => "random",
        }
    }

    /// Whether more than one callback may share a name under this policy.
    pub fn allows_many(&self) -> bool {
        !matches!(self, Self::Single)
    }
}

impl fmt::Display for InvokePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvokePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown invoke policy: {other}")),
        }
    }
}
