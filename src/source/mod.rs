pub mod file;
pub mod intake;
pub mod memory;
pub mod message;
pub mod timestamp;
pub mod traits;

pub use file::FileSource;
pub use intake::{
    Acknowledger, IntakeAdapter, IntakeError, IntakeSettings, Pulled, Settlement,
};
pub use memory::MemorySource;
pub use message::{AckHandle, Message};
pub use traits::{PullResponse, Source, SourceError};
