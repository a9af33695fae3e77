use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use bytes::Bytes;
use crate::core::error::{Error, Result};
use crate::core::types::Subject;
use crate::storage::mime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(Error::bad_request(format!("Unsupported method: {}", other))),
        }
    }
}

/// A request as handed over by the HTTP adapter.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Database path, e.g. `/db/apps/run.xq/extra`.
    pub path: String,
    pub parameters: Vec<(String, String)>,
    /// Header names are stored lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub subject: Subject,
    /// Set when a URL rewriter routed the request here.
    pub rewritten: bool,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            parameters: Vec::new(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
            subject: Subject::guest(),
            rewritten: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Request::new(Method::Get, path)
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.with_header("content-type", content_type)
    }

    pub fn as_subject(mut self, subject: Subject) -> Self {
        self.subject = subject;
        self
    }

    pub fn as_rewritten(mut self) -> Self {
        self.rewritten = true;
        self
    }

    /// First value of a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Content type without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(mime::base_type)
            .filter(|t| !t.is_empty())
    }

    pub fn body_text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|_| Error::bad_request("Request body is not valid UTF-8"))
    }

    /// Parameters grouped by name, for the query's request context.
    pub fn parameter_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.parameters {
            map.entry(name.clone()).or_default().push(value.clone());
        }
        map
    }

    /// A copy with the `application/x-www-form-urlencoded` body merged into the parameters.
    pub fn with_form_body(&self) -> Result<Request> {
        let mut merged = self.clone();
        for pair in self.body_text()?.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            merged.parameters.push((decode_form(name)?, decode_form(value)?));
        }
        Ok(merged)
    }
}

fn decode_form(raw: &str) -> Result<String> {
    urlencoding::decode(&raw.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::bad_request(format!("Malformed form parameter: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let request = Request::get("/db").with_header("Content-Type", "text/xml; charset=UTF-8");
        assert_eq!(request.header("content-type"), Some("text/xml; charset=UTF-8"));
        assert_eq!(request.content_type(), Some("text/xml"));
    }

    #[test]
    fn form_body_is_decoded_into_parameters() {
        let request = Request::new(Method::Post, "/db")
            .with_param("start", "2")
            .with_body(mime::URL_ENCODED, "_query=for+%24x+in+1+to+3&_howmany=2");
        let merged = request.with_form_body().unwrap();
        assert_eq!(merged.param("_query"), Some("for $x in 1 to 3"));
        assert_eq!(merged.param("_howmany"), Some("2"));
        assert_eq!(merged.param("start"), Some("2"));
    }

    #[test]
    fn parses_methods() {
        assert_eq!("delete".parse::<Method>().unwrap(), Method::Delete);
        assert!("PATCH".parse::<Method>().is_err());
    }
}
