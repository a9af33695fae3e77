pub mod request;
pub mod response;
pub mod params;
pub mod envelope;
pub mod serialize;
pub mod dispatcher;
pub mod mutation;
pub mod service;

pub use dispatcher::{RequestAdapter, RequestDispatcher, UpdateProcessor};
pub use request::{Method, Request};
pub use response::Response;
pub use service::QueryService;
