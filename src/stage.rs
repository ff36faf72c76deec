//! The stages of the authentication flow.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// One phase of the authentication flow. Exactly one is focused at a time. Stages are ordered
/// the way the flow moves forward.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Waiting for a username.
    #[default]
    #[display("user selection")]
    UserSelection,
    /// Choosing the broker that authenticates the user.
    #[display("broker selection")]
    BrokerSelection,
    /// Choosing how to authenticate with the selected broker.
    #[display("authentication mode selection")]
    AuthModeSelection,
    /// Answering the challenge of the selected mode.
    #[display("challenge")]
    Challenge,
}

impl Stage {
    /// The stage backward navigation leads to, if any.
    pub fn previous(self) -> Option<Stage> {
        match self {
            Stage::UserSelection => None,
            Stage::BrokerSelection => Some(Stage::UserSelection),
            Stage::AuthModeSelection => Some(Stage::BrokerSelection),
            Stage::Challenge => Some(Stage::AuthModeSelection),
        }
    }
}
