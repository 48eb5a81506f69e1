use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::value::{ContractId, Val};

/// Classification of a contract event. The wire strings are `"system"` and
/// `"contract"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    System,
    Contract,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::System => "system",
            EventType::Contract => "contract",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(EventType::System),
            "contract" => Ok(EventType::Contract),
            _ => Err(()),
        }
    }
}

/// An event emitted by a contract invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractEvent {
    pub contract_id: Option<ContractId>,
    pub event_type: EventType,
    /// Ordered topic segments, 1..=4 of them.
    pub topics: Vec<Val>,
    pub value: Val,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_strings() {
        assert_eq!(EventType::System.as_str(), "system");
        assert_eq!(EventType::Contract.as_str(), "contract");
        assert_eq!("system".parse::<EventType>().unwrap(), EventType::System);
        assert!("other".parse::<EventType>().is_err());
    }
}
