pub mod mime;
pub mod resource;
pub mod store;
pub mod memory;
pub mod lock;
