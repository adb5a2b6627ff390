//! Effects produced by state transitions

use super::state::IntakeRecord;
use std::time::Duration;

/// Effects to be executed, in order, after the new state is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send text back to the correspondent
    Reply { text: String },

    /// Re-send the short menu after `delay` unless the dialogue moved on.
    /// Replaces any follow-up already pending for the correspondent.
    ScheduleFollowUp { delay: Duration },

    /// Hand a completed intake to the notification gateway
    NotifyIntake { record: IntakeRecord },
}

impl Effect {
    pub fn reply(text: impl Into<String>) -> Self {
        Effect::Reply { text: text.into() }
    }

    pub fn reply_text(&self) -> Option<&str> {
        match self {
            Effect::Reply { text } => Some(text),
            _ => None,
        }
    }
}
