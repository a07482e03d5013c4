//! Decides when the embedded engine's internal work queue gets serviced.
//!
//! The engine asks for work through [`MessagePumpScheduler::request_pump`];
//! the host ticks the scheduler once per frame and the [`ForcePolicy`] tops
//! that up with forced pumps so the engine never starves.

mod policy;
mod scheduler;

pub use policy::ForcePolicy;
pub use scheduler::{EnginePump, MessagePumpScheduler, PumpState};
