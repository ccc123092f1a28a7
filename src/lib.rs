pub mod cli;
pub mod clock;
pub mod commit;
pub mod config;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod transform;
pub mod watermark;
pub mod window;
