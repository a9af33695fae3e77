use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::http::request::Request;
use crate::query::session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMethod {
    #[default]
    Xml,
    Json,
}

impl OutputMethod {
    /// `json` selects JSON; any other serialization method is written as XML.
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            OutputMethod::Json
        } else {
            OutputMethod::Xml
        }
    }
}

/// Control parameters of a query request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub query: Option<String>,
    pub start: i64,
    pub howmany: i64,
    /// `None` when the client did not say; inline queries then wrap, stored ones do not.
    pub wrap: Option<bool>,
    pub cache: bool,
    pub session: Option<SessionId>,
    pub release: Option<SessionId>,
    pub typed: bool,
    pub method: OutputMethod,
    pub encoding: String,
    pub source: bool,
    pub variables: Option<String>,
    /// Content type for unwrapped output.
    pub media_type: Option<String>,
}

impl RequestParams {
    pub fn defaults(config: &Config) -> Self {
        RequestParams {
            query: None,
            start: 1,
            howmany: 10,
            wrap: None,
            cache: false,
            session: None,
            release: None,
            typed: false,
            method: OutputMethod::Xml,
            encoding: config.default_encoding.clone(),
            source: false,
            variables: None,
            media_type: None,
        }
    }

    /// Reads the control parameters, each accepted bare or with a leading `_`.
    pub fn from_request(request: &Request, config: &Config) -> Result<Self> {
        let mut params = RequestParams::defaults(config);

        if !config.safe_mode {
            params.query = lookup(request, "xpath")
                .or_else(|| lookup(request, "query"))
                .map(str::to_string);
            if let Some(value) = lookup(request, "source") {
                params.source = parse_bool("source", value)?;
            }
        }
        if let Some(value) = lookup(request, "howmany").or_else(|| lookup(request, "max")) {
            params.howmany = parse_int("howmany", value)?;
        }
        if let Some(value) = lookup(request, "start") {
            params.start = parse_int("start", value)?;
        }
        if let Some(value) = lookup(request, "wrap").or_else(|| lookup(request, "enclose")) {
            params.wrap = Some(parse_bool("wrap", value)?);
        }
        if let Some(value) = lookup(request, "cache") {
            params.cache = parse_bool("cache", value)?;
        }
        if let Some(value) = lookup(request, "typed") {
            params.typed = parse_bool("typed", value)?;
        }
        if let Some(value) = lookup(request, "session") {
            params.session = parse_session("session", value)?;
        }
        if let Some(value) = lookup(request, "release") {
            params.release = parse_session("release", value)?;
        }
        if let Some(value) = lookup(request, "method") {
            params.method = OutputMethod::parse(value);
        }
        if let Some(value) = lookup(request, "encoding").filter(|v| !v.is_empty()) {
            params.encoding = value.to_string();
        }
        params.variables = lookup(request, "variables").map(str::to_string);
        Ok(params)
    }

    pub fn wrap(&self) -> bool {
        self.wrap.unwrap_or(true)
    }
}

/// Value of `name` or `_name`, the bare form taking precedence.
pub fn lookup<'r>(request: &'r Request, name: &str) -> Option<&'r str> {
    request
        .param(name)
        .or_else(|| request.param(&format!("_{}", name)))
}

pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" => Ok(true),
        "no" | "false" => Ok(false),
        _ => Err(Error::bad_request(format!(
            "Parameter _{} should be yes or no, got: {}",
            name, value
        ))),
    }
}

pub fn parse_int(name: &str, value: &str) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::bad_request(format!("Parameter _{} should be an int", name)))
}

/// Negative ids mean "no session".
fn parse_session(name: &str, value: &str) -> Result<Option<SessionId>> {
    let id = parse_int(name, value)?;
    Ok(u64::try_from(id).ok().map(SessionId::from_raw))
}
