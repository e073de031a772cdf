pub mod clock;
pub mod endpoint;
pub mod parser;
