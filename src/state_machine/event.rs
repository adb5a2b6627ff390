//! Events fed into the dialogue state machine

/// Events that trigger state transitions for one correspondent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Text message from the correspondent
    Inbound { body: String },

    /// A deferred menu follow-up came due
    FollowUpDue,
}

impl Event {
    pub fn inbound(body: impl Into<String>) -> Self {
        Event::Inbound { body: body.into() }
    }
}
