//! Upstox API collaborators outside the token lifecycle
//!
//! Profile verification and the instruments-master download. Both only
//! consume configuration or an already-acquired token string.

pub mod contracts;
pub mod profile;
