pub mod dead_letter;
pub mod record;

pub use dead_letter::{
    DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink, JsonLinesDeadLetter,
    LogDeadLetter, MemoryDeadLetter,
};
pub use record::{Record, RecordTransformer, TransformError};
