#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use bytes::Bytes;
use parking_lot::Mutex;
use xmlgate::core::config::Config;
use xmlgate::core::error::{Error, ErrorKind, Result};
use xmlgate::core::transaction::Transaction;
use xmlgate::core::types::ResourcePath;
use xmlgate::http::{RequestAdapter, RequestDispatcher, UpdateProcessor};
use xmlgate::http::request::Request;
use xmlgate::query::context::QueryContext;
use xmlgate::query::engine::{CompiledProgram, Item, QueryEngine, Sequence};
use xmlgate::query::source::QuerySource;
use xmlgate::storage::memory::InMemoryStore;
use xmlgate::storage::mime;
use xmlgate::storage::resource::{AccessPolicy, DatabaseResource};
use xmlgate::storage::store::{Mutation, Store, TxnId};
use xmlgate::xml::parser::Element;

/// Query engine driven by one-word scripts:
///
/// * `range N` returns the integers 1..=N
/// * `vars` returns `name=value` for every bound variable
/// * `context` describes the static and HTTP context
/// * `sleep MS` sleeps, then returns nothing
/// * `loop` spins on the watchdog until it cancels
/// * `fail` fails at evaluation time
/// * anything containing `syntax-error` fails to compile
/// * any other text is returned as a single string
#[derive(Default)]
pub struct ScriptedEngine {
    compiles: AtomicUsize,
}

impl ScriptedEngine {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl QueryEngine for ScriptedEngine {
    fn compile(&self, source: &QuerySource, _context: &QueryContext) -> Result<Box<dyn CompiledProgram>> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let text = source.text()?.trim().to_string();
        if text.contains("syntax-error") {
            return Err(Error::new(ErrorKind::CompileFailure, format!("err:XPST0003 unexpected token in {}", text)));
        }
        Ok(Box::new(Script(text)))
    }
}

struct Script(String);

impl CompiledProgram for Script {
    fn execute(&self, context: &mut QueryContext) -> Result<Sequence> {
        let (command, argument) = self.0.split_once(' ').unwrap_or((self.0.as_str(), ""));
        match command {
            "range" => {
                let n: i64 = argument.trim().parse().unwrap_or(0);
                Ok((1..=n).map(Item::integer).collect())
            }
            "vars" => Ok(context
                .variables()
                .map(|(name, value)| {
                    let rendered: Vec<String> = value
                        .iter()
                        .map(|item| match item {
                            Item::Node { xml } => xml.clone(),
                            Item::Atomic { value, .. } => value.clone(),
                        })
                        .collect();
                    Item::string(format!("{}={}", name.local_name, rendered.join(",")))
                })
                .collect()),
            "context" => {
                let http = context.http.clone().unwrap_or_default();
                let docs: Vec<String> = context.static_documents.iter().map(|d| d.to_string()).collect();
                Ok(vec![
                    Item::string(format!("docs={}", docs.join(","))),
                    Item::string(format!("module={}", context.module_load_path.clone().unwrap_or_default())),
                    Item::string(format!("servlet={}", http.servlet_path.unwrap_or_default())),
                    Item::string(format!("info={}", http.path_info.unwrap_or_default())),
                    Item::string(format!("method={}", http.method)),
                    Item::string(format!("user={}", context.subject.name)),
                    Item::string(format!("adapted={}", context.attributes.contains_key("adapted"))),
                ]
                .into())
            }
            "sleep" => {
                thread::sleep(Duration::from_millis(argument.trim().parse().unwrap_or(10)));
                Ok(Sequence::empty())
            }
            "loop" => loop {
                context.watchdog.proceed()?;
            },
            "fail" => Err(Error::new(ErrorKind::EvaluationFailure, "err:FOER0000 failed on purpose".to_string())),
            _ => Ok(vec![Item::string(self.0.clone())].into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub windows: usize,
    pub max_open: usize,
}

/// Store wrapper that records path lookups and transaction windows.
pub struct RecordingStore {
    pub inner: InMemoryStore,
    probes: Mutex<Vec<ResourcePath>>,
    open: AtomicUsize,
    stats: Mutex<WindowStats>,
}

impl RecordingStore {
    pub fn new() -> Self {
        RecordingStore {
            inner: InMemoryStore::new(),
            probes: Mutex::new(Vec::new()),
            open: AtomicUsize::new(0),
            stats: Mutex::new(WindowStats::default()),
        }
    }

    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().iter().map(|p| p.to_string()).collect()
    }

    pub fn clear_probes(&self) {
        self.probes.lock().clear();
    }

    pub fn windows(&self) -> WindowStats {
        self.stats.lock().clone()
    }

    pub fn content(&self, path: &str) -> Option<String> {
        let path = ResourcePath::parse(path).ok()?;
        self.inner
            .resource(&path)
            .and_then(|r| r.document().map(|d| String::from_utf8_lossy(&d.content).into_owned()))
    }
}

impl Store for RecordingStore {
    fn resource(&self, path: &ResourcePath) -> Option<DatabaseResource> {
        self.probes.lock().push(path.clone());
        self.inner.resource(path)
    }

    fn children(&self, collection: &ResourcePath) -> Vec<DatabaseResource> {
        self.inner.children(collection)
    }

    fn begin(&self) -> Result<TxnId> {
        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = self.stats.lock();
            stats.windows += 1;
            stats.max_open = stats.max_open.max(open);
        }
        self.inner.begin()
    }

    fn apply(&self, txn: TxnId, mutation: Mutation) -> Result<()> {
        self.inner.apply(txn, mutation)
    }

    fn staged(&self, txn: TxnId, path: &ResourcePath) -> Option<DatabaseResource> {
        self.inner.staged(txn, path)
    }

    fn commit(&self, txn: TxnId) -> Result<()> {
        self.inner.commit(txn)
    }

    fn abort(&self, txn: TxnId) -> Result<()> {
        self.inner.abort(txn)
    }

    fn close(&self, txn: TxnId) {
        self.inner.close(txn);
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replaces every target with `<updated n="K"/>`, K being the number of
/// `xupdate:*` directives. A root attribute `fail="yes"` makes it fail after
/// the first target.
pub struct ReplacingUpdater;

impl UpdateProcessor for ReplacingUpdater {
    fn process(&self, xupdate: &Element, targets: &[ResourcePath], tx: &mut Transaction<'_>) -> Result<u64> {
        let directives = xupdate.child_elements().count() as u64;
        let mut modifications = 0;
        for target in targets {
            tx.replace_content(target, Bytes::from(format!("<updated n=\"{}\"/>", directives)))?;
            modifications += directives;
            if xupdate.attribute("fail") == Some("yes") {
                return Err(Error::bad_request("XUpdate failed on purpose"));
            }
        }
        Ok(modifications)
    }
}

pub struct MarkingAdapter;

impl RequestAdapter for MarkingAdapter {
    fn adapt(&self, _request: &Request, context: &mut QueryContext) {
        context.attributes.insert("adapted".to_string(), "yes".to_string());
    }
}

pub struct Fixture {
    pub store: Arc<RecordingStore>,
    pub engine: Arc<ScriptedEngine>,
    pub dispatcher: RequestDispatcher,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(RecordingStore::new());
        let engine = Arc::new(ScriptedEngine::default());
        let dispatcher = RequestDispatcher::new(config, store.clone(), engine.clone())
            .with_update_processor(Arc::new(ReplacingUpdater))
            .with_request_adapter(Arc::new(MarkingAdapter));
        Fixture { store, engine, dispatcher }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.dispatcher = self.dispatcher.with_policy(policy);
        self
    }

    pub fn xml(&self, path: &str, content: &str) -> &Self {
        self.store.inner.insert_document(path, mime::XML, content.to_string()).unwrap();
        self
    }

    pub fn query(&self, path: &str, script: &str) -> &Self {
        self.store.inner.insert_document(path, mime::XQUERY, script.to_string()).unwrap();
        self
    }

    pub fn binary(&self, path: &str, mime_type: &str, content: &[u8]) -> &Self {
        self.store.inner.insert_document(path, mime_type, content.to_vec()).unwrap();
        self
    }

    pub fn collection(&self, path: &str) -> &Self {
        self.store.inner.create_collection(path).unwrap();
        self
    }

    pub fn dispatch(&self, request: Request) -> xmlgate::Response {
        self.dispatcher.dispatch(&request)
    }

    /// Every lock taken so far has been released.
    pub fn assert_no_locks_held(&self) {
        let stats = self.dispatcher.locks().stats();
        assert_eq!(stats.held(), 0, "locks still held: {:?}", stats);
    }
}
