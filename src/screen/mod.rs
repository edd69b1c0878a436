//! Server-side screen selection: state machine plus transition guard.
//!
//! [`state`] holds the pure decision logic (who should receive input);
//! [`guard`] owns the shared state and the checker/securer task pair that
//! realize and serialize transitions.

pub mod guard;
pub mod state;

pub use guard::TransitionController;
pub use state::{decide, ClientView, ScreenPosition, Transition};
