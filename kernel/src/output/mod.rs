pub mod logger;
pub mod serial;
