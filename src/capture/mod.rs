pub mod frame_source;
pub mod retry;
pub mod scheduler;
pub mod traits;
