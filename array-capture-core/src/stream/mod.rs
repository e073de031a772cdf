pub mod device;
pub mod engine;
pub mod programmer;
