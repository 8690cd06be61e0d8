pub mod manager;
pub mod process;
pub mod progress;
