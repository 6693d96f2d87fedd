pub mod context;
pub mod engine;
pub mod event_bus;
pub mod history;
pub mod interpreter;
pub mod jobs;
pub mod machine;
pub mod session;
pub mod state;
