pub const XQUERY: &str = "application/xquery";
pub const XPROC: &str = "application/xproc+xml";
pub const XML: &str = "application/xml";
pub const TEXT: &str = "text/plain";
pub const HTML: &str = "text/html";
pub const JSON: &str = "application/json";
pub const BINARY: &str = "application/octet-stream";
pub const URL_ENCODED: &str = "application/x-www-form-urlencoded";

/// Strips parameters (`; charset=...`) from a Content-Type value.
pub fn base_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

pub fn is_xml_type(mime: &str) -> bool {
    let mime = base_type(mime);
    mime == XML || mime == "text/xml" || mime.ends_with("+xml")
}

/// Query sources stored as binary resources.
pub fn is_executable_type(mime: &str) -> bool {
    base_type(mime) == XQUERY
}

/// MIME type guessed from a resource name's extension.
pub fn for_name(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("xml") | Some("xsd") | Some("xsl") | Some("xslt") | Some("xconf") => XML,
        Some("xq") | Some("xql") | Some("xqy") | Some("xquery") | Some("xqm") => XQUERY,
        Some("xpl") => XPROC,
        Some("txt") => TEXT,
        Some("html") | Some("htm") => HTML,
        Some("json") => JSON,
        _ => BINARY,
    }
}
