//! Pure state transition function
//!
//! Given the same state, context and event this always produces the same
//! result and performs no I/O. `new_state == None` means the correspondent has
//! no entry afterwards: either the dialogue ended or it never started.

use super::replies;
use super::{ConvContext, ConvState, Effect, Event, IntakeRecord};
use crate::validation::{is_email_opt_out, phone_from_correspondent, validate_email, validate_name};
use thiserror::Error;

/// Starts a dialogue for an untracked correspondent
pub const ACTIVATION_KEYWORD: &str = "info";

/// Return a tracked correspondent to the main menu
const RESTART_KEYWORDS: [&str; 2] = ["hola", "/start"];

/// Rejected inputs allowed at the menu and name steps
pub const MAX_INVALID_ATTEMPTS: u32 = 3;

/// Stored in place of an email when the correspondent answers "no"
pub const EMAIL_NOT_PROVIDED: &str = "No proporcionado";

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: Option<ConvState>,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: Some(state),
            effects: vec![],
        }
    }

    /// Dialogue over (or never started): drop the entry
    pub fn ended() -> Self {
        Self {
            new_state: None,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn replies(&self) -> impl Iterator<Item = &str> {
        self.effects.iter().filter_map(Effect::reply_text)
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("cannot derive a phone number from correspondent {0:?}")]
    UnroutableCorrespondent(String),
}

pub fn transition(
    state: Option<&ConvState>,
    context: &ConvContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // Activation works from any state, including none
        (_, Event::Inbound { body }) if is_keyword(&body, ACTIVATION_KEYWORD) => Ok(show_full_menu()),

        // Untracked correspondents are ignored; late follow-ups for ended dialogues too
        (None, _) => Ok(TransitionResult::ended()),

        (Some(_), Event::Inbound { body })
            if RESTART_KEYWORDS.iter().any(|k| is_keyword(&body, k)) =>
        {
            Ok(show_full_menu())
        }

        // ============================================================
        // Deferred menu
        // ============================================================
        (Some(ConvState::MainMenu { invalid_attempts, .. }), Event::FollowUpDue) => {
            Ok(TransitionResult::new(ConvState::MainMenu {
                menu_shown: true,
                invalid_attempts: *invalid_attempts,
            })
            .with_effect(Effect::reply(replies::SHORT_MENU)))
        }

        // Moved on since the follow-up was scheduled
        (Some(state), Event::FollowUpDue) => Ok(TransitionResult::new(state.clone())),

        // ============================================================
        // Dialogue steps
        // ============================================================
        (
            Some(ConvState::MainMenu {
                menu_shown,
                invalid_attempts,
            }),
            Event::Inbound { body },
        ) => Ok(main_menu(*menu_shown, *invalid_attempts, &body, context)),

        (Some(ConvState::AwaitingName { invalid_attempts }), Event::Inbound { body }) => {
            awaiting_name(*invalid_attempts, &body, context)
        }

        (Some(ConvState::AwaitingEmail { name, phone }), Event::Inbound { body }) => {
            Ok(awaiting_email(name, phone, &body, context))
        }
    }
}

fn is_keyword(body: &str, keyword: &str) -> bool {
    body.trim().to_lowercase() == keyword
}

fn show_full_menu() -> TransitionResult {
    // Showing the long-form greeting is what flips `menu_shown`
    TransitionResult::new(ConvState::MainMenu {
        menu_shown: true,
        invalid_attempts: ConvState::fresh().invalid_attempts(),
    })
    .with_effect(Effect::reply(replies::FULL_MENU))
}

fn main_menu(
    menu_shown: bool,
    invalid_attempts: u32,
    body: &str,
    context: &ConvContext,
) -> TransitionResult {
    match body.trim() {
        "1" => TransitionResult::new(ConvState::MainMenu {
            menu_shown: true,
            invalid_attempts: 0,
        })
        .with_effect(Effect::reply(replies::SESSION_INFO))
        .with_effect(Effect::ScheduleFollowUp {
            delay: context.follow_up_delay,
        }),
        "2" => TransitionResult::new(ConvState::AwaitingName {
            invalid_attempts: 0,
        })
        .with_effect(Effect::reply(replies::ASK_NAME)),
        "3" => TransitionResult::ended().with_effect(Effect::reply(replies::EXIT_FAREWELL)),
        _ => {
            let attempts = invalid_attempts + 1;
            if attempts >= MAX_INVALID_ATTEMPTS {
                TransitionResult::ended().with_effect(Effect::reply(replies::MENU_EXHAUSTED))
            } else {
                TransitionResult::new(ConvState::MainMenu {
                    menu_shown,
                    invalid_attempts: attempts,
                })
                .with_effect(Effect::reply(replies::MENU_REPROMPT))
            }
        }
    }
}

fn awaiting_name(
    invalid_attempts: u32,
    body: &str,
    context: &ConvContext,
) -> Result<TransitionResult, TransitionError> {
    let Ok(name) = validate_name(body) else {
        let attempts = invalid_attempts + 1;
        return Ok(if attempts >= MAX_INVALID_ATTEMPTS {
            TransitionResult::ended().with_effect(Effect::reply(replies::NAME_EXHAUSTED))
        } else {
            TransitionResult::new(ConvState::AwaitingName {
                invalid_attempts: attempts,
            })
            .with_effect(Effect::reply(replies::NAME_REPROMPT))
        });
    };

    let phone = phone_from_correspondent(&context.correspondent)
        .ok_or_else(|| TransitionError::UnroutableCorrespondent(context.correspondent.clone()))?;

    Ok(TransitionResult::new(ConvState::AwaitingEmail {
        name: name.to_string(),
        phone: phone.to_string(),
    })
    .with_effect(Effect::reply(replies::ASK_EMAIL)))
}

fn awaiting_email(name: &str, phone: &str, body: &str, context: &ConvContext) -> TransitionResult {
    let email = if is_email_opt_out(body) {
        EMAIL_NOT_PROVIDED
    } else if let Ok(email) = validate_email(body) {
        email
    } else {
        // No attempt counter at this step
        return TransitionResult::new(ConvState::AwaitingEmail {
            name: name.to_string(),
            phone: phone.to_string(),
        })
        .with_effect(Effect::reply(replies::EMAIL_REPROMPT));
    };

    let record = IntakeRecord {
        correspondent: context.correspondent.clone(),
        name: name.to_string(),
        phone: phone.to_string(),
        email: email.to_string(),
    };

    TransitionResult::ended()
        .with_effect(Effect::reply(replies::thank_you(name)))
        .with_effect(Effect::NotifyIntake { record })
}
