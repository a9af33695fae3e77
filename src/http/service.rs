use std::sync::Arc;
use tokio::task;
use tracing::error;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::dispatcher::RequestDispatcher;
use crate::http::serialize::{exception_xml, with_charset};
use crate::storage::mime;

/// Async front door for an HTTP adapter.
///
/// Each request runs on its own blocking worker, since lock waits and query
/// evaluation block the calling thread.
#[derive(Clone)]
pub struct QueryService {
    dispatcher: Arc<RequestDispatcher>,
}

impl QueryService {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        QueryService { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub async fn handle(&self, request: Request) -> Response {
        let dispatcher = self.dispatcher.clone();
        let path = request.path.clone();
        match task::spawn_blocking(move || dispatcher.dispatch(&request)).await {
            Ok(response) => response,
            Err(err) => {
                error!(%path, error = %err, "request worker failed");
                let encoding = &self.dispatcher.config().default_encoding;
                Response::new(500).with_body(
                    with_charset(mime::XML, encoding),
                    exception_xml(&path, "Internal server error", None),
                )
            }
        }
    }
}
