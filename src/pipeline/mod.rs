pub mod backpressure;
pub mod channel;
pub mod runner;

pub use backpressure::{BackpressureGate, RetryGuard};
pub use channel::{create_channel, IntakeEvent, Receiver, Sender};
pub use runner::{Pipeline, PipelineError, PipelineReport};
