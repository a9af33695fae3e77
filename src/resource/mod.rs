pub mod locked;
pub mod resolver;
