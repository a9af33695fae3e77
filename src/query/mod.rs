pub mod context;
pub mod engine;
pub mod source;
pub mod pool;
pub mod session;
