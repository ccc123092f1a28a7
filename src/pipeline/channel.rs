use crate::source::Message;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// Intake task to windowing task.
#[derive(Debug)]
pub enum IntakeEvent {
    Message(Message),
    /// Low watermark reported by the source
    Hint(DateTime<Utc>),
    /// A finite source has nothing more to deliver
    EndOfStream,
}

/// Bounded channel; senders wait when it is full.
pub fn create_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(capacity.max(1))
}
