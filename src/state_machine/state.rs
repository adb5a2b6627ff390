//! Per-correspondent dialogue state

use std::fmt;
use std::time::Duration;

/// Where a correspondent is in the intake dialogue.
///
/// Each variant carries only what has been collected so far. There is no
/// terminal variant: finishing or abandoning the dialogue removes the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvState {
    /// Choosing between info, booking and exit
    MainMenu {
        /// Long-form greeting already shown
        menu_shown: bool,
        invalid_attempts: u32,
    },

    /// Asked for a full name
    AwaitingName { invalid_attempts: u32 },

    /// Name accepted, asked for an email (or "no").
    /// Unbounded retries, so no attempt counter.
    AwaitingEmail { name: String, phone: String },
}

impl ConvState {
    /// State created by the activation keyword, before the menu is shown
    pub fn fresh() -> Self {
        ConvState::MainMenu {
            menu_shown: false,
            invalid_attempts: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            ConvState::MainMenu { .. } => Phase::MainMenu,
            ConvState::AwaitingName { .. } => Phase::CollectingName,
            ConvState::AwaitingEmail { .. } => Phase::CollectingEmail,
        }
    }

    pub fn invalid_attempts(&self) -> u32 {
        match self {
            ConvState::MainMenu {
                invalid_attempts, ..
            }
            | ConvState::AwaitingName { invalid_attempts } => *invalid_attempts,
            ConvState::AwaitingEmail { .. } => 0,
        }
    }
}

impl Default for ConvState {
    fn default() -> Self {
        Self::fresh()
    }
}

/// Phase tag, for logging and assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    MainMenu,
    CollectingName,
    CollectingEmail,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::MainMenu => "main_menu",
            Phase::CollectingName => "collecting_name",
            Phase::CollectingEmail => "collecting_email",
        })
    }
}

/// Fixed inputs for a transition besides state and event
#[derive(Debug, Clone)]
pub struct ConvContext {
    /// Opaque transport id of the correspondent (`573001234567@c.us`)
    pub correspondent: String,
    /// How long after the info reply the short menu is re-sent
    pub follow_up_delay: Duration,
}

impl ConvContext {
    pub fn new(correspondent: impl Into<String>, follow_up_delay: Duration) -> Self {
        Self {
            correspondent: correspondent.into(),
            follow_up_delay,
        }
    }
}

/// A finished intake, handed to the notification gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeRecord {
    pub correspondent: String,
    pub name: String,
    pub phone: String,
    /// Address, or the opt-out placeholder
    pub email: String,
}

impl IntakeRecord {
    /// Plain-text notification body
    pub fn notification_body(&self) -> String {
        format!(
            "Nuevo paciente: {}\nCorreo: {}\nWhatsApp: {}",
            self.name, self.email, self.phone
        )
    }
}
