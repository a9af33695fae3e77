use std::fmt::Write;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use crate::core::error::{Error, Result};
use crate::http::params::OutputMethod;
use crate::http::response::Response;
use crate::query::engine::{Item, Sequence};
use crate::query::session::SessionId;
use crate::storage::mime;
use crate::storage::resource::DatabaseResource;
use crate::xml::escape::{escape_attr, escape_text};
use crate::xml::EXIST_NS;

/// The slice of a result that is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// 1-based position of the first returned item, as requested.
    pub start: i64,
    pub count: usize,
    pub hits: usize,
}

impl Window {
    pub fn items<'a>(&self, result: &'a Sequence) -> &'a [Item] {
        if self.count == 0 {
            return &[];
        }
        let offset = (self.start - 1) as usize;
        &result.items()[offset..offset + self.count]
    }
}

/// Computes the returned window of a result of `hits` items.
///
/// A non-empty result rejects a `start` outside `1..=hits`. A count that is not
/// positive or runs past the end is clamped to the remaining items. An empty
/// result always yields zero items.
pub fn paginate(hits: usize, start: i64, howmany: i64) -> Result<Window> {
    if hits == 0 {
        return Ok(Window { start, count: 0, hits });
    }
    let len = hits as i64;
    if start < 1 || start > len {
        return Err(Error::bad_request("Start parameter out of range"));
    }
    let remaining = len - start + 1;
    let count = if howmany <= 0 || howmany > remaining { remaining } else { howmany };
    Ok(Window { start, count: count as usize, hits })
}

/// How a result is to be written.
#[derive(Debug, Clone)]
pub struct ResultOptions {
    pub start: i64,
    pub howmany: i64,
    pub wrap: bool,
    pub typed: bool,
    pub method: OutputMethod,
    pub encoding: String,
    pub media_type: Option<String>,
    pub session: Option<SessionId>,
    pub compilation_time: u64,
    pub execution_time: u64,
}

impl ResultOptions {
    pub fn new(encoding: impl Into<String>) -> Self {
        ResultOptions {
            start: 1,
            howmany: 10,
            wrap: true,
            typed: false,
            method: OutputMethod::Xml,
            encoding: encoding.into(),
            media_type: None,
            session: None,
            compilation_time: 0,
            execution_time: 0,
        }
    }
}

/// Writes the paginated result in the requested output method.
pub fn results(result: &Sequence, options: &ResultOptions) -> Result<Response> {
    let window = paginate(result.len(), options.start, options.howmany)?;
    match options.method {
        OutputMethod::Json => json_results(result, &window, options),
        OutputMethod::Xml => Ok(xml_results(result, &window, options)),
    }
}

fn xml_results(result: &Sequence, window: &Window, options: &ResultOptions) -> Response {
    let mut out = String::new();
    if options.wrap {
        let _ = write!(
            out,
            "<exist:result xmlns:exist=\"{}\" exist:hits=\"{}\" exist:start=\"{}\" exist:count=\"{}\" \
             exist:compilation-time=\"{}\" exist:execution-time=\"{}\"",
            EXIST_NS, window.hits, window.start, window.count, options.compilation_time, options.execution_time
        );
        if let Some(session) = options.session {
            let _ = write!(out, " exist:session=\"{}\"", session);
        }
        out.push('>');
        for item in window.items(result) {
            write_wrapped_item(&mut out, item, options.typed);
        }
        out.push_str("</exist:result>");
        return Response::ok().with_body(with_charset(mime::XML, &options.encoding), out);
    }

    let mut previous_atomic = false;
    for item in window.items(result) {
        match item {
            Item::Node { xml } => {
                out.push_str(xml);
                previous_atomic = false;
            }
            Item::Atomic { value, .. } => {
                if previous_atomic {
                    out.push(' ');
                }
                out.push_str(&escape_text(value));
                previous_atomic = true;
            }
        }
    }
    let media_type = options.media_type.as_deref().unwrap_or(mime::XML);
    Response::ok().with_body(with_charset(media_type, &options.encoding), out)
}

fn write_wrapped_item(out: &mut String, item: &Item, typed: bool) {
    match item {
        Item::Node { xml } if !typed => out.push_str(xml),
        Item::Node { xml } => {
            let _ = write!(out, "<exist:value exist:type=\"{}\">{}</exist:value>", item.type_name(), xml);
        }
        Item::Atomic { type_name, value } => {
            let _ = write!(
                out,
                "<exist:value exist:type=\"{}\">{}</exist:value>",
                escape_attr(type_name),
                escape_text(value)
            );
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonResult<'a> {
    start: i64,
    count: usize,
    hits: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<u64>,
    compilation_time: u64,
    execution_time: u64,
    data: Vec<&'a str>,
}

fn json_results(result: &Sequence, window: &Window, options: &ResultOptions) -> Result<Response> {
    let data = window
        .items(result)
        .iter()
        .map(|item| match item {
            Item::Node { xml } => xml.as_str(),
            Item::Atomic { value, .. } => value.as_str(),
        })
        .collect();
    let body = serde_json::to_vec(&JsonResult {
        start: window.start,
        count: window.count,
        hits: window.hits,
        session: options.session.map(|s| s.raw()),
        compilation_time: options.compilation_time,
        execution_time: options.execution_time,
        data,
    })?;
    Ok(Response::ok().with_body(with_charset(mime::JSON, &options.encoding), body))
}

pub fn with_charset(media_type: &str, encoding: &str) -> String {
    format!("{}; charset={}", media_type, encoding)
}

/// Error body as `<exception>` XML.
pub fn exception_xml(path: &str, message: &str, query: Option<&str>) -> String {
    let mut out = String::from("<?xml version=\"1.0\" ?><exception><path>");
    out.push_str(&escape_text(path));
    out.push_str("</path><message>");
    out.push_str(&escape_text(message));
    out.push_str("</message>");
    if let Some(query) = query {
        out.push_str("<query>");
        out.push_str(&escape_text(query));
        out.push_str("</query>");
    }
    out.push_str("</exception>");
    out
}

/// Error body as a small HTML page, for browsers.
pub fn exception_html(path: &str, message: &str, query: Option<&str>) -> String {
    let mut out = String::from("<html><head><title>Query Error</title></head><body><h1>Error found</h1>");
    let _ = write!(
        out,
        "<div class=\"path\"><span class=\"path\">Path: </span><a href=\"{0}\">{1}</a></div>",
        escape_attr(path),
        escape_text(path)
    );
    let _ = write!(
        out,
        "<div class=\"message\"><span class=\"message\">Message: </span>{}</div>",
        escape_text(message)
    );
    if let Some(query) = query {
        let _ = write!(
            out,
            "<div class=\"query\"><span class=\"query\">Query: </span><pre>{}</pre></div>",
            escape_text(query)
        );
    }
    out.push_str("</body></html>");
    out
}

pub fn xupdate_result(modifications: u64, encoding: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" ?><exist:modifications xmlns:exist=\"{}\" count=\"{}\">{} modifications processed.</exist:modifications>",
        EXIST_NS, modifications, modifications
    );
    Response::ok().with_body(with_charset(mime::XML, encoding), body)
}

fn xs_date_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Listing of a collection's readable children.
pub fn collection_listing(collection: &DatabaseResource, children: &[DatabaseResource], encoding: &str) -> Response {
    let permissions = collection.permissions();
    let mut out = String::new();
    let _ = write!(
        out,
        "<exist:result xmlns:exist=\"{}\"><exist:collection name=\"{}\" created=\"{}\" owner=\"{}\" group=\"{}\" permissions=\"{}\">",
        EXIST_NS,
        escape_attr(&collection.path().to_string()),
        xs_date_time(collection.created()),
        escape_attr(&permissions.owner),
        escape_attr(&permissions.group),
        permissions
    );
    for child in children {
        let name = escape_attr(child.path().last_segment().unwrap_or_default());
        let permissions = child.permissions();
        let owner = escape_attr(&permissions.owner);
        let group = escape_attr(&permissions.group);
        if child.is_collection() {
            let _ = write!(
                out,
                "<exist:collection name=\"{}\" created=\"{}\" owner=\"{}\" group=\"{}\" permissions=\"{}\"/>",
                name,
                xs_date_time(child.created()),
                owner,
                group,
                permissions
            );
        } else {
            let _ = write!(
                out,
                "<exist:resource name=\"{}\" created=\"{}\" last-modified=\"{}\" owner=\"{}\" group=\"{}\" permissions=\"{}\"/>",
                name,
                xs_date_time(child.created()),
                xs_date_time(child.last_modified()),
                owner,
                group,
                permissions
            );
        }
    }
    out.push_str("</exist:collection></exist:result>");
    Response::ok().with_body(with_charset(mime::XML, encoding), out)
}
