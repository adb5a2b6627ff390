//! Intake dialogue state machine
//!
//! Pure transitions in the Elm Architecture style: the runtime feeds events in,
//! applies the returned state, and executes the returned effects.

mod effect;
pub mod event;
pub mod replies;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::Event;
pub use state::{ConvContext, ConvState, IntakeRecord, Phase};
pub use transition::transition;
