pub mod provider;
pub mod providers;
pub mod types;
