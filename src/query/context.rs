use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{ResourcePath, Subject};
use crate::query::engine::Sequence;

/// Expanded variable name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QName {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespace: Option<String>,
}

impl QName {
    pub fn local(name: impl Into<String>) -> Self {
        QName { prefix: None, local_name: name.into(), namespace: None }
    }

    /// Parses `prefix:local` or `local`.
    pub fn parse(name: &str, namespace: Option<String>) -> Self {
        match name.split_once(':') {
            Some((prefix, local)) => QName {
                prefix: Some(prefix.to_string()),
                local_name: local.to_string(),
                namespace,
            },
            None => QName { prefix: None, local_name: name.to_string(), namespace },
        }
    }
}

/// Cooperative step and time budget for one execution.
#[derive(Debug, Clone)]
pub struct Watchdog {
    max_steps: Option<u64>,
    timeout: Option<Duration>,
    steps: u64,
    started: Instant,
    killed: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn new(max_steps: Option<u64>, timeout: Option<Duration>) -> Self {
        Watchdog {
            max_steps,
            timeout,
            steps: 0,
            started: Instant::now(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn unbounded() -> Self {
        Watchdog::new(None, None)
    }

    /// Starts a fresh budget. A pending kill is cleared.
    pub fn reset(&mut self) {
        self.steps = 0;
        self.started = Instant::now();
        self.killed = Arc::new(AtomicBool::new(false));
    }

    /// Handle another thread can use to cancel the running evaluation.
    pub fn kill_switch(&self) -> Arc<AtomicBool> {
        self.killed.clone()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Called by the evaluator once per step.
    pub fn proceed(&mut self) -> Result<()> {
        self.steps += 1;
        if self.killed.load(Ordering::Relaxed) {
            return Err(Error::new(ErrorKind::EvaluationFailure, "Query was killed".to_string()));
        }
        if let Some(max) = self.max_steps {
            if self.steps > max {
                return Err(Error::new(
                    ErrorKind::EvaluationFailure,
                    format!("Query exceeded the limit of {} steps", max),
                ));
            }
        }
        if let Some(timeout) = self.timeout {
            if self.started.elapsed() > timeout {
                return Err(Error::new(
                    ErrorKind::EvaluationFailure,
                    format!("Query exceeded the time limit of {} ms", timeout.as_millis()),
                ));
            }
        }
        Ok(())
    }
}

/// Request data exposed to queries through the request module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpContext {
    pub method: String,
    pub parameters: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    /// Path of the executing stored query, for queries found by walking upward.
    pub servlet_path: Option<String>,
    /// Request path remainder below `servlet_path`.
    pub path_info: Option<String>,
}

/// Static and dynamic context of one compiled query instance.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub subject: Subject,
    pub static_documents: Vec<ResourcePath>,
    pub base_uri: Option<String>,
    pub module_load_path: Option<String>,
    namespaces: BTreeMap<String, String>,
    variables: BTreeMap<QName, Sequence>,
    pub http: Option<HttpContext>,
    /// Attributes contributed by the request adapter.
    pub attributes: BTreeMap<String, String>,
    pub watchdog: Watchdog,
}

impl QueryContext {
    pub fn new(subject: Subject, watchdog: Watchdog) -> Self {
        QueryContext {
            subject,
            static_documents: Vec::new(),
            base_uri: None,
            module_load_path: None,
            namespaces: BTreeMap::new(),
            variables: BTreeMap::new(),
            http: None,
            attributes: BTreeMap::new(),
            watchdog,
        }
    }

    pub fn declare_namespace(&mut self, prefix: impl Into<String>, uri: impl Into<String>) {
        self.namespaces.insert(prefix.into(), uri.into());
    }

    pub fn namespace(&self, prefix: &str) -> Option<&str> {
        self.namespaces.get(prefix).map(String::as_str)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (&str, &str)> {
        self.namespaces.iter().map(|(p, u)| (p.as_str(), u.as_str()))
    }

    pub fn declare_variable(&mut self, name: QName, value: Sequence) {
        self.variables.insert(name, value);
    }

    /// Looks a variable up by local name, ignoring namespace.
    pub fn variable(&self, local_name: &str) -> Option<&Sequence> {
        self.variables
            .iter()
            .find(|(name, _)| name.local_name == local_name)
            .map(|(_, value)| value)
    }

    pub fn variables(&self) -> impl Iterator<Item = (&QName, &Sequence)> {
        self.variables.iter()
    }

    /// Clears everything a previous request bound and starts a new watchdog budget.
    pub fn prepare_for_reuse(&mut self) {
        self.static_documents.clear();
        self.base_uri = None;
        self.module_load_path = None;
        self.namespaces.clear();
        self.variables.clear();
        self.http = None;
        self.attributes.clear();
        self.watchdog.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::engine::Item;

    #[test]
    fn step_budget_is_enforced_and_reset() {
        let mut watchdog = Watchdog::new(Some(3), None);
        for _ in 0..3 {
            watchdog.proceed().unwrap();
        }
        let err = watchdog.proceed().unwrap_err();
        assert_eq!(err.kind, ErrorKind::EvaluationFailure);

        watchdog.reset();
        assert_eq!(watchdog.steps(), 0);
        watchdog.proceed().unwrap();
    }

    #[test]
    fn kill_switch_cancels_evaluation() {
        let mut watchdog = Watchdog::unbounded();
        watchdog.kill_switch().store(true, Ordering::Relaxed);
        assert!(watchdog.proceed().is_err());
        watchdog.reset();
        assert!(watchdog.proceed().is_ok());
    }

    #[test]
    fn reuse_clears_request_state() {
        let mut context = QueryContext::new(Subject::guest(), Watchdog::unbounded());
        context.declare_variable(QName::local("x"), Sequence::from(vec![Item::integer(1)]));
        context.declare_namespace("f", "urn:foo");
        context.static_documents.push(ResourcePath::parse("/db/a").unwrap());
        context.http = Some(HttpContext::default());

        context.prepare_for_reuse();

        assert!(context.variable("x").is_none());
        assert!(context.namespace("f").is_none());
        assert!(context.static_documents.is_empty());
        assert!(context.http.is_none());
    }

    #[test]
    fn qname_splits_prefix() {
        let name = QName::parse("f:bar", Some("urn:foo".into()));
        assert_eq!(name.prefix.as_deref(), Some("f"));
        assert_eq!(name.local_name, "bar");
    }
}
