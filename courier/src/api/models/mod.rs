//! Request and response bodies.

pub mod deliveries;
pub mod events;
