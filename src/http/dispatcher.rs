use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use tracing::{debug, error, info_span, warn};
use uuid::Uuid;
use crate::core::config::{Config, FeatureEnabled};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::transaction::{Transaction, TransactionManager};
use crate::core::types::{ResourcePath, Subject};
use crate::http::envelope::{Declarations, QueryEnvelope};
use crate::http::params::{lookup, OutputMethod, RequestParams};
use crate::http::request::{Method, Request};
use crate::http::response::{parse_http_date, Response};
use crate::http::serialize::{self, collection_listing, exception_html, exception_xml, with_charset, ResultOptions};
use crate::query::context::{HttpContext, QueryContext, Watchdog};
use crate::query::engine::QueryEngine;
use crate::query::pool::{CompiledQuery, QueryPool};
use crate::query::session::{ResultSessionCache, SessionId, SessionSweeper};
use crate::query::source::QuerySource;
use crate::resource::locked::LockedResource;
use crate::resource::resolver::{Located, ResolveMode, ResourceResolver};
use crate::storage::lock::{LockManager, LockMode};
use crate::storage::mime;
use crate::storage::resource::{Access, AccessPolicy, AllowAll, DatabaseResource};
use crate::storage::store::Store;
use crate::xml::parser::{parse_document, Element};
use crate::xml::{EXIST_NS, XUPDATE_NS};

/// Applies an XUpdate document inside a transaction.
pub trait UpdateProcessor: Send + Sync {
    /// Returns the number of modifications made to `targets`.
    fn process(&self, xupdate: &Element, targets: &[ResourcePath], tx: &mut Transaction<'_>) -> Result<u64>;
}

/// Request module: exposes request data to queries beyond [`HttpContext`].
pub trait RequestAdapter: Send + Sync {
    fn adapt(&self, request: &Request, context: &mut QueryContext);
}

/// Turns normalized requests into responses.
///
/// One dispatcher is shared by every worker. The query pool and session cache
/// may also be shared between dispatchers through [`with_query_pool`] and
/// [`with_sessions`].
///
/// [`with_query_pool`]: RequestDispatcher::with_query_pool
/// [`with_sessions`]: RequestDispatcher::with_sessions
pub struct RequestDispatcher {
    pub(super) config: Config,
    pub(super) store: Arc<dyn Store>,
    pub(super) resolver: ResourceResolver,
    engine: Arc<dyn QueryEngine>,
    pub(super) policy: Arc<dyn AccessPolicy>,
    pub(super) pool: Arc<QueryPool>,
    sessions: Arc<ResultSessionCache>,
    pub(super) transactions: TransactionManager,
    pub(super) update_processor: Option<Arc<dyn UpdateProcessor>>,
    request_adapter: Option<Arc<dyn RequestAdapter>>,
}

impl RequestDispatcher {
    pub fn new(config: Config, store: Arc<dyn Store>, engine: Arc<dyn QueryEngine>) -> Self {
        let locks = LockManager::new(config.lock_timeout());
        RequestDispatcher {
            resolver: ResourceResolver::new(store.clone(), locks),
            pool: Arc::new(QueryPool::new(config.query_pool_max_sources, config.query_pool_max_per_source)),
            sessions: Arc::new(ResultSessionCache::new(config.session_initial_slots, config.session_timeout())),
            transactions: TransactionManager::new(store.clone()),
            policy: Arc::new(AllowAll),
            update_processor: None,
            request_adapter: None,
            config,
            store,
            engine,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_update_processor(mut self, processor: Arc<dyn UpdateProcessor>) -> Self {
        self.update_processor = Some(processor);
        self
    }

    pub fn with_request_adapter(mut self, adapter: Arc<dyn RequestAdapter>) -> Self {
        self.request_adapter = Some(adapter);
        self
    }

    pub fn with_query_pool(mut self, pool: Arc<QueryPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<ResultSessionCache>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn query_pool(&self) -> &Arc<QueryPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<ResultSessionCache> {
        &self.sessions
    }

    pub fn locks(&self) -> &LockManager {
        self.resolver.locks()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Starts the periodic session sweep at the configured check period.
    pub fn spawn_sweeper(&self) -> Result<SessionSweeper> {
        SessionSweeper::spawn(self.sessions.clone(), self.config.session_check_period())
    }

    /// Handles one request. Failures become error envelopes.
    pub fn dispatch(&self, request: &Request) -> Response {
        let request_id = Uuid::new_v4();
        let span = info_span!("request", id = %request_id, method = %request.method, path = %request.path);
        let _entered = span.enter();
        let started = Instant::now();

        let response = match self.route(request) {
            Ok(response) => response,
            Err(err) => self.error_response(request, &err),
        };
        debug!(status = response.status, elapsed_ms = started.elapsed().as_millis() as u64, "request handled");
        response
    }

    fn route(&self, request: &Request) -> Result<Response> {
        let path = ResourcePath::parse(&request.path)?;
        match request.method {
            Method::Get => self.do_get(request, &path),
            Method::Head => self.do_head(request, &path),
            Method::Post => self.do_post(request, &path),
            Method::Put => self.do_put(request, &path),
            Method::Delete => self.do_delete(request, &path),
        }
    }

    fn error_response(&self, request: &Request, err: &Error) -> Response {
        let status = err.status_code();
        if status >= 500 {
            error!(kind = ?err.kind, error = %err, "request failed");
        } else {
            debug!(kind = ?err.kind, error = %err, "request rejected");
        }

        let encoding = lookup(request, "encoding")
            .filter(|e| !e.is_empty())
            .unwrap_or(self.config.default_encoding.as_str());
        let query = err.query.as_deref();
        let (media_type, body) = if prefers_html(request) {
            (mime::HTML, exception_html(&request.path, &err.context, query))
        } else {
            (mime::XML, exception_xml(&request.path, &err.context, query))
        };
        Response::new(status).with_body(with_charset(media_type, encoding), body)
    }

    fn do_get(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        let params = RequestParams::from_request(request, &self.config)?;
        if let Some(id) = params.release {
            self.sessions.release(id);
            return Ok(Response::ok());
        }
        if let Some(query) = &params.query {
            let declarations = match &params.variables {
                Some(xml) => Declarations::parse(xml)?,
                None => Declarations::default(),
            };
            return self.search(request, path, query, &params, &declarations);
        }

        let mode = if params.source { ResolveMode::Direct } else { ResolveMode::ExecutableSearch };
        let located = self.resolver.resolve(path, mode)?;
        let resource = located.resource.resource();

        if resource.is_collection() {
            if self.config.safe_mode || !self.policy.permits(&request.subject, resource, Access::Read) {
                return Err(Error::permission_denied("Not allowed to read collection"));
            }
            let children: Vec<DatabaseResource> = self
                .store
                .children(path)
                .into_iter()
                .filter(|child| self.policy.permits(&request.subject, child, Access::Read))
                .collect();
            return Ok(collection_listing(resource, &children, &params.encoding));
        }

        if !self.policy.permits(&request.subject, resource, Access::Read) {
            return Err(Error::permission_denied(format!(
                "Permission to read resource {} denied",
                located.servlet_path
            )));
        }
        if !resource.is_executable() {
            return self.write_resource(request, located.resource, &params.encoding);
        }
        if params.source {
            return self.show_source(located.resource, &params.encoding);
        }
        self.execute_stored(request, located, &params)
            .map_err(|err| if err.is_query_failure() { err.at_status(500) } else { err })
    }

    /// Plain document content, honouring `If-Modified-Since`.
    fn write_resource(&self, request: &Request, locked: LockedResource, encoding: &str) -> Result<Response> {
        let resource = locked.resource();
        let Some(document) = resource.document() else {
            return Err(Error::new(ErrorKind::Internal, format!("{} is not a document", locked.path())));
        };

        if let Some(value) = request.header("if-modified-since") {
            match parse_http_date(value) {
                Some(since) if since > Utc::now() => {
                    debug!(since = %since, "If-Modified-Since in the future ignored");
                }
                Some(since) if document.last_modified <= since => {
                    let mut response = Response::new(304);
                    response.set_timestamps(document.created, document.last_modified);
                    return Ok(response);
                }
                Some(_) => {}
                None => warn!(value, "unparsable If-Modified-Since header ignored"),
            }
        }

        let mut response = Response::ok().with_body(content_type(resource, encoding), document.content.clone());
        response.set_header("Content-Length", document.content.len().to_string());
        response.set_timestamps(document.created, document.last_modified);
        Ok(response)
    }

    fn show_source(&self, locked: LockedResource, encoding: &str) -> Result<Response> {
        let path = locked.path().to_string();
        if !self.config.allows_source(&path) {
            return Err(Error::permission_denied(format!(
                "Permission to view XQuery source for: {} denied",
                path
            )));
        }
        let resource = locked.release();
        let content = resource.document().map(|d| d.content.clone()).unwrap_or_default();
        Ok(Response::ok().with_body(with_charset(mime::TEXT, encoding), content))
    }

    fn do_head(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        if let Some(response) = self.check_for_query_target(request, path)? {
            return Ok(response);
        }
        let params = RequestParams::from_request(request, &self.config)?;
        let Some(locked) = self.resolver.open(path, LockMode::Read)? else {
            return Err(Error::not_found(format!("No resource at location: {}", path)));
        };
        let resource = locked.resource();
        if !self.policy.permits(&request.subject, resource, Access::Read) {
            return Err(Error::permission_denied(format!("Permission to read resource {} denied", path)));
        }

        let mut response = Response::ok();
        response.set_header("Content-Type", content_type(resource, &params.encoding));
        match resource.document() {
            Some(document) => {
                response.set_header("Content-Length", document.content.len().to_string());
                response.set_timestamps(document.created, document.last_modified);
            }
            None => response.set_timestamps(resource.created(), resource.created()),
        }
        Ok(response)
    }

    fn do_post(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        if let Some(located) = self.resolver.find_executable(path)? {
            let params = RequestParams::from_request(request, &self.config)?;
            return self
                .execute_stored(request, located, &params)
                .map_err(|err| if err.is_query_failure() { err.at_status(500) } else { err });
        }

        if request.content_type() == Some(mime::URL_ENCODED) {
            return self.do_get(&request.with_form_body()?, path);
        }

        let root = parse_document(request.body_text()?)?;
        if root.is(EXIST_NS, "query") {
            let envelope = QueryEnvelope::parse(&root)?;
            let mut params = RequestParams::from_request(request, &self.config)?;
            apply_envelope(&mut params, &envelope);
            let Some(query) = envelope.query.as_deref().filter(|q| !q.trim().is_empty()) else {
                return Err(Error::bad_request("No query specified"));
            };
            return self.search(request, path, query, &params, &envelope.declarations);
        }
        if root.namespace.as_deref() == Some(XUPDATE_NS) {
            return self.xupdate(request, path, &root);
        }
        Err(Error::bad_request(format!("Unknown XML root element: {}", root.name)))
    }

    /// Executes a stored query found by resolution. The whole result is written;
    /// it is wrapped only if the client asked for it.
    pub(super) fn execute_stored(&self, request: &Request, located: Located, params: &RequestParams) -> Result<Response> {
        let Located { resource: locked, servlet_path, path_info } = located;
        let Some(document) = locked.resource().document() else {
            return Err(Error::new(ErrorKind::Internal, format!("{} is not a document", servlet_path)));
        };
        let collection = document.collection.clone();
        let source = QuerySource::Stored {
            path: servlet_path.clone(),
            last_modified: document.last_modified,
            content: document.content.clone(),
        };

        let prepare = |context: &mut QueryContext| {
            context.static_documents = vec![collection.clone()];
            context.module_load_path = Some(collection.to_string());
            self.bind_request(request, context, Some(servlet_path.to_string()), Some(path_info.clone()));
        };

        let compile_started = Instant::now();
        let mut borrowed = self.pool.borrow(&source.fingerprint(), || self.compile(&source, &request.subject, &prepare))?;
        if borrowed.cached {
            prepare(&mut borrowed.query.context);
        }
        let compilation_time = if borrowed.cached { 0 } else { elapsed_ms(compile_started) };

        let execute_started = Instant::now();
        let result = match borrowed.query.execute() {
            Ok(result) => result,
            Err(err) => {
                self.pool.discard(borrowed.query);
                return Err(err);
            }
        };
        let execution_time = elapsed_ms(execute_started);
        drop(locked);

        let options = ResultOptions {
            start: 1,
            howmany: -1,
            wrap: params.wrap == Some(true),
            typed: params.typed,
            method: params.method,
            encoding: params.encoding.clone(),
            media_type: params.media_type.clone(),
            session: None,
            compilation_time,
            execution_time,
        };
        let response = serialize::results(&result, &options);
        self.pool.return_instance(borrowed.query);
        Ok(response?.with_header("X-XQuery-Cached", borrowed.cached.to_string()))
    }

    /// Runs an ad-hoc query against `path`.
    fn search(
        &self,
        request: &Request,
        path: &ResourcePath,
        query: &str,
        params: &RequestParams,
        declarations: &Declarations,
    ) -> Result<Response> {
        check_submission(self.config.xquery_submission, &request.subject, "XQuery")?;

        if let Some(id) = params.session {
            if let Some(result) = self.sessions.get(query, id) {
                debug!(session = %id, "reply served from session cache");
                return serialize::results(&result, &self.result_options(params, Some(id), 0, 0));
            }
        }

        let source = QuerySource::Inline(query.to_string());
        let prepare = |context: &mut QueryContext| {
            context.static_documents = vec![path.clone()];
            context.base_uri = Some(path.to_string());
            for (prefix, uri) in &declarations.namespaces {
                context.declare_namespace(prefix.clone(), uri.clone());
            }
            for variable in &declarations.variables {
                context.declare_variable(variable.name.clone(), variable.value.clone());
            }
            self.bind_request(request, context, None, None);
        };

        let compile_started = Instant::now();
        let mut borrowed = self
            .pool
            .borrow(&source.fingerprint(), || self.compile(&source, &request.subject, &prepare))
            .map_err(|err| err.with_query(query))?;
        if borrowed.cached {
            prepare(&mut borrowed.query.context);
        }
        let compilation_time = if borrowed.cached { 0 } else { elapsed_ms(compile_started) };

        let execute_started = Instant::now();
        let result = match borrowed.query.execute() {
            Ok(result) => result,
            Err(err) => {
                self.pool.discard(borrowed.query);
                return Err(err.with_query(query));
            }
        };
        let execution_time = elapsed_ms(execute_started);

        let session = params.cache.then(|| self.sessions.add(query, result.clone()));
        let options = self.result_options(params, session, compilation_time, execution_time);
        let response = serialize::results(&result, &options);
        self.pool.return_instance(borrowed.query);

        let mut response = response?;
        if let Some(id) = session {
            response.set_header("X-Session-Id", id.to_string());
        }
        Ok(response)
    }

    fn result_options(
        &self,
        params: &RequestParams,
        session: Option<SessionId>,
        compilation_time: u64,
        execution_time: u64,
    ) -> ResultOptions {
        ResultOptions {
            start: params.start,
            howmany: params.howmany,
            wrap: params.wrap(),
            typed: params.typed,
            method: params.method,
            encoding: params.encoding.clone(),
            media_type: params.media_type.clone(),
            session,
            compilation_time,
            execution_time,
        }
    }

    /// Compiles `source` against a fresh context prepared for this request.
    fn compile(
        &self,
        source: &QuerySource,
        subject: &Subject,
        prepare: &dyn Fn(&mut QueryContext),
    ) -> Result<CompiledQuery> {
        let watchdog = Watchdog::new(self.config.watchdog_max_steps, self.config.watchdog_timeout());
        let mut context = QueryContext::new(subject.clone(), watchdog);
        prepare(&mut context);
        let program = self.engine.compile(source, &context)?;
        debug!(path = ?source.path(), "query compiled");
        Ok(CompiledQuery::new(source.fingerprint(), program, context))
    }

    fn bind_request(
        &self,
        request: &Request,
        context: &mut QueryContext,
        servlet_path: Option<String>,
        path_info: Option<String>,
    ) {
        context.subject = request.subject.clone();
        context.http = Some(HttpContext {
            method: request.method.to_string(),
            parameters: request.parameter_map(),
            headers: request.headers.clone(),
            servlet_path,
            path_info,
        });
        if let Some(adapter) = &self.request_adapter {
            adapter.adapt(request, context);
        }
    }

    /// For rewritten requests, executes a stored query at or above `path`.
    pub(super) fn check_for_query_target(&self, request: &Request, path: &ResourcePath) -> Result<Option<Response>> {
        if !request.rewritten {
            return Ok(None);
        }
        let Some(located) = self.resolver.find_executable(path)? else {
            return Ok(None);
        };
        let params = RequestParams::from_request(request, &self.config)?;
        self.execute_stored(request, located, &params).map(Some)
    }
}

pub(super) fn check_submission(flag: FeatureEnabled, subject: &Subject, feature: &str) -> Result<()> {
    match flag {
        FeatureEnabled::Enabled => Ok(()),
        FeatureEnabled::Disabled => Err(Error::permission_denied(format!("{} submission is disabled", feature))),
        FeatureEnabled::AuthenticatedUsersOnly if subject.is_guest() => Err(Error::permission_denied(format!(
            "{} submission is only allowed for authenticated users",
            feature
        ))),
        FeatureEnabled::AuthenticatedUsersOnly => Ok(()),
    }
}

/// Envelope attributes and output properties override URL parameters.
fn apply_envelope(params: &mut RequestParams, envelope: &QueryEnvelope) {
    if let Some(start) = envelope.start {
        params.start = start;
    }
    if let Some(howmany) = envelope.howmany {
        params.howmany = howmany;
    }
    if envelope.wrap.is_some() {
        params.wrap = envelope.wrap;
    }
    if let Some(method) = &envelope.method {
        params.method = OutputMethod::parse(method);
    }
    if let Some(typed) = envelope.typed {
        params.typed = typed;
    }
    if let Some(cache) = envelope.cache {
        params.cache = cache;
    }
    if envelope.session.is_some() {
        params.session = envelope.session;
    }
    if envelope.mime.is_some() {
        params.media_type = envelope.mime.clone();
    }
    if let Some(method) = envelope.property("method") {
        params.method = OutputMethod::parse(method);
    }
    if let Some(encoding) = envelope.property("encoding") {
        params.encoding = encoding.to_string();
    }
    if let Some(media_type) = envelope.property("media-type") {
        params.media_type = Some(media_type.to_string());
    }
}

fn content_type(resource: &DatabaseResource, encoding: &str) -> String {
    match resource {
        DatabaseResource::Collection(_) => with_charset(mime::XML, encoding),
        DatabaseResource::XmlDocument(d) => with_charset(&d.mime_type, encoding),
        DatabaseResource::BinaryDocument(d) if d.mime_type.starts_with("text/") => with_charset(&d.mime_type, encoding),
        DatabaseResource::BinaryDocument(d) => d.mime_type.clone(),
    }
}

/// True when the first markup type listed in `Accept` is HTML.
fn prefers_html(request: &Request) -> bool {
    request.header("accept").is_some_and(|accept| {
        accept
            .split(',')
            .map(mime::base_type)
            .find(|t| *t == mime::HTML || t.ends_with("xml"))
            == Some(mime::HTML)
    })
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_flags_gate_guests() {
        let guest = Subject::guest();
        let user = Subject::user("editor");
        assert!(check_submission(FeatureEnabled::Enabled, &guest, "XQuery").is_ok());
        assert_eq!(
            check_submission(FeatureEnabled::Disabled, &user, "XQuery").unwrap_err().status_code(),
            403
        );
        assert!(check_submission(FeatureEnabled::AuthenticatedUsersOnly, &guest, "XUpdate").is_err());
        assert!(check_submission(FeatureEnabled::AuthenticatedUsersOnly, &user, "XUpdate").is_ok());
    }

    #[test]
    fn html_is_chosen_only_when_listed_first() {
        let browser = Request::get("/db").with_header("Accept", "text/html,application/xhtml+xml;q=0.9");
        assert!(prefers_html(&browser));
        let client = Request::get("/db").with_header("Accept", "application/xml, text/html");
        assert!(!prefers_html(&client));
        assert!(!prefers_html(&Request::get("/db")));
    }

    #[test]
    fn envelope_overrides_url_parameters() {
        let mut params = RequestParams::defaults(&Config::default());
        let envelope = QueryEnvelope {
            start: Some(3),
            wrap: Some(false),
            properties: vec![("method".to_string(), "json".to_string())],
            ..QueryEnvelope::default()
        };
        apply_envelope(&mut params, &envelope);
        assert_eq!(params.start, 3);
        assert_eq!(params.howmany, 10);
        assert_eq!(params.wrap, Some(false));
        assert_eq!(params.method, OutputMethod::Json);
    }
}
