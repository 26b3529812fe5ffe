// src/commands.rs
//! Interaction payloads from the chat front end, decoded into a closed set of
//! commands. Anything outside the set is rejected, never silently dropped.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PollError;
use crate::models::{ClosedPoll, PollResults, VoteReceipt};
use crate::poll::PollLifecycle;
use crate::vote::VoteEngine;

const CUSTOM_ID_PREFIX: &str = "poll";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PollCommand {
    Vote { poll_id: Uuid, option_id: Uuid },
    Close { poll_id: Uuid },
    Results { poll_id: Uuid },
    MyVotes { poll_id: Uuid },
}

impl PollCommand {
    /// Decode a component id of the form `poll:<action>:<poll_id>[:<option_id>]`.
    pub fn from_custom_id(custom_id: &str) -> Result<Self, PollError> {
        let parts: Vec<&str> = custom_id.split(':').collect();
        let (prefix, action, rest) = match parts.as_slice() {
            [prefix, action, rest @ ..] => (*prefix, *action, rest),
            _ => return Err(PollError::InvalidOption),
        };
        if prefix != CUSTOM_ID_PREFIX {
            return Err(PollError::InvalidOption);
        }
        let id = |raw: &str| Uuid::parse_str(raw).map_err(|_| PollError::InvalidOption);

        match (action, rest) {
            ("vote", [poll_id, option_id]) => Ok(PollCommand::Vote {
                poll_id: id(*poll_id)?,
                option_id: id(*option_id)?,
            }),
            ("close", [poll_id]) => Ok(PollCommand::Close {
                poll_id: id(*poll_id)?,
            }),
            ("results", [poll_id]) => Ok(PollCommand::Results {
                poll_id: id(*poll_id)?,
            }),
            ("my_votes", [poll_id]) => Ok(PollCommand::MyVotes {
                poll_id: id(*poll_id)?,
            }),
            _ => Err(PollError::InvalidOption),
        }
    }

    pub fn custom_id(&self) -> String {
        match self {
            PollCommand::Vote { poll_id, option_id } => {
                format!("{CUSTOM_ID_PREFIX}:vote:{poll_id}:{option_id}")
            }
            PollCommand::Close { poll_id } => format!("{CUSTOM_ID_PREFIX}:close:{poll_id}"),
            PollCommand::Results { poll_id } => format!("{CUSTOM_ID_PREFIX}:results:{poll_id}"),
            PollCommand::MyVotes { poll_id } => format!("{CUSTOM_ID_PREFIX}:my_votes:{poll_id}"),
        }
    }
}

/// One interaction: who acted, and either a structured command or a component id.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    pub user_id: String,
    #[serde(default)]
    pub custom_id: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Interaction {
    pub fn command(&self) -> Result<PollCommand, PollError> {
        if let Some(custom_id) = &self.custom_id {
            return PollCommand::from_custom_id(custom_id);
        }
        serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
            .map_err(|_| PollError::InvalidOption)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandReply {
    Vote(VoteReceipt),
    Closed(Box<ClosedPoll>),
    Results(PollResults),
    MyVotes { option_ids: BTreeSet<Uuid> },
}

pub async fn dispatch(
    engine: &VoteEngine,
    lifecycle: &PollLifecycle,
    user_id: &str,
    command: PollCommand,
) -> Result<CommandReply, PollError> {
    match command {
        PollCommand::Vote { poll_id, option_id } => engine
            .cast_or_retract(poll_id, user_id, option_id)
            .await
            .map(CommandReply::Vote),
        PollCommand::Close { poll_id } => lifecycle
            .close_poll(poll_id, user_id)
            .await
            .map(|closed| CommandReply::Closed(Box::new(closed))),
        PollCommand::Results { poll_id } => engine
            .compute_results(poll_id)
            .await
            .map(CommandReply::Results),
        PollCommand::MyVotes { poll_id } => engine
            .list_user_votes(poll_id, user_id)
            .await
            .map(|option_ids| CommandReply::MyVotes { option_ids }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_ids_decode_to_known_commands() {
        let poll_id = Uuid::new_v4();
        let option_id = Uuid::new_v4();
        let vote = PollCommand::Vote { poll_id, option_id };
        assert_eq!(PollCommand::from_custom_id(&vote.custom_id()).unwrap(), vote);
        assert_eq!(
            PollCommand::from_custom_id(&format!("poll:results:{poll_id}")).unwrap(),
            PollCommand::Results { poll_id }
        );
    }

    #[test]
    fn unknown_or_malformed_custom_ids_are_rejected() {
        let poll_id = Uuid::new_v4();
        for bad in [
            "".to_string(),
            "poll".to_string(),
            format!("poll:delete:{poll_id}"),
            format!("quiz:vote:{poll_id}:{poll_id}"),
            format!("poll:vote:{poll_id}"),
            "poll:close:not-a-uuid".to_string(),
        ] {
            assert!(
                matches!(PollCommand::from_custom_id(&bad), Err(PollError::InvalidOption)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn structured_payloads_decode() {
        let poll_id = Uuid::new_v4();
        let interaction: Interaction = serde_json::from_value(json!({
            "user_id": "u1",
            "action": "my_votes",
            "poll_id": poll_id,
        }))
        .unwrap();
        assert_eq!(
            interaction.command().unwrap(),
            PollCommand::MyVotes { poll_id }
        );

        let unknown: Interaction = serde_json::from_value(json!({
            "user_id": "u1",
            "action": "reopen",
            "poll_id": poll_id,
        }))
        .unwrap();
        assert!(matches!(unknown.command(), Err(PollError::InvalidOption)));
    }
}
