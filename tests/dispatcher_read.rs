mod common;

use std::thread;
use std::time::Duration;
use common::Fixture;
use xmlgate::core::config::{Config, FeatureEnabled};
use xmlgate::http::request::{Method, Request};
use xmlgate::storage::mime;
use xmlgate::xml::parser::parse_document;
use xmlgate::Response;

fn query(text: &str) -> Request {
    Request::get("/db").with_param("_query", text)
}

/// Text of every item in a wrapped result.
fn values(response: &Response) -> Vec<String> {
    let root = parse_document(&response.body_text()).unwrap();
    root.child_elements().map(|e| e.text()).collect()
}

fn attribute(response: &Response, name: &str) -> String {
    let root = parse_document(&response.body_text()).unwrap();
    root.attribute(name).unwrap_or_default().to_string()
}

#[test]
fn inline_query_is_paginated() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("range 5").with_param("_start", "3").with_param("_howmany", "10"));

    assert_eq!(response.status, 200);
    assert_eq!(response.content_type(), Some("application/xml; charset=UTF-8"));
    assert_eq!(attribute(&response, "exist:hits"), "5");
    assert_eq!(attribute(&response, "exist:count"), "3");
    assert_eq!(values(&response), vec!["3", "4", "5"]);
    fixture.assert_no_locks_held();
}

#[test]
fn start_past_the_end_is_a_bad_request() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("range 5").with_param("_start", "6").with_param("_howmany", "1"));
    assert_eq!(response.status, 400);
    assert!(response.body_text().contains("Start parameter out of range"));
}

#[test]
fn empty_result_ignores_window() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("range 0").with_param("start", "99").with_param("max", "-4"));
    assert_eq!(response.status, 200);
    assert_eq!(attribute(&response, "exist:count"), "0");
    assert!(values(&response).is_empty());
}

#[test]
fn json_output_reports_timings_and_data() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("range 4").with_param("_howmany", "2").with_param("method", "json"));
    assert_eq!(response.content_type(), Some("application/json; charset=UTF-8"));

    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value["hits"], 4);
    assert_eq!(value["count"], 2);
    assert_eq!(value["data"], serde_json::json!(["1", "2"]));
    assert!(value["executionTime"].is_u64());
}

#[test]
fn compile_errors_echo_the_query() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("syntax-error here"));
    assert_eq!(response.status, 400);
    let body = response.body_text();
    assert!(body.contains("<exception>"));
    assert!(body.contains("<query>syntax-error here</query>"));
    assert_eq!(fixture.dispatcher.query_pool().stats().idle_instances, 0);
}

#[test]
fn runaway_query_is_cancelled_by_the_watchdog() {
    let config = Config { watchdog_max_steps: Some(500), ..Config::default() };
    let fixture = Fixture::with_config(config);
    let response = fixture.dispatch(query("loop"));
    assert_eq!(response.status, 400);
    assert!(response.body_text().contains("limit of 500 steps"));
    assert_eq!(fixture.dispatcher.query_pool().stats().discarded, 1);
}

#[test]
fn second_execution_reuses_instance_without_leaking_variables() {
    let fixture = Fixture::new();
    let variables = r#"<exist:variables xmlns:exist="http://exist.sourceforge.net/NS/exist"
            xmlns:sx="http://exist-db.org/xquery/types/serialized">
        <exist:variable>
            <exist:qname><exist:localname>x</exist:localname></exist:qname>
            <sx:sequence><sx:value type="xs:integer">7</sx:value></sx:sequence>
        </exist:variable>
    </exist:variables>"#;

    let first = fixture.dispatch(query("vars").with_param("variables", variables));
    assert_eq!(values(&first), vec!["x=7"]);

    let second = fixture.dispatch(query("vars"));
    assert_eq!(second.status, 200);
    assert!(values(&second).is_empty());

    assert_eq!(fixture.engine.compiles(), 1);
    let stats = fixture.dispatcher.query_pool().stats();
    assert_eq!((stats.hit_count, stats.miss_count), (1, 1));
}

#[test]
fn cached_session_answers_identical_query_only() {
    let fixture = Fixture::new();
    let first = fixture.dispatch(query("range 3").with_param("_cache", "yes"));
    let session = first.header("X-Session-Id").unwrap().to_string();
    assert_eq!(attribute(&first, "exist:session"), session);

    let hits_before = fixture.dispatcher.query_pool().stats().hit_count;
    let replay = fixture.dispatch(query("range 3").with_param("_session", session.as_str()).with_param("_start", "2"));
    assert_eq!(values(&replay), vec!["2", "3"]);
    assert_eq!(fixture.dispatcher.query_pool().stats().hit_count, hits_before);

    let other = fixture.dispatch(query("range  3").with_param("_session", session.as_str()));
    assert_eq!(other.status, 200);
    assert_eq!(fixture.engine.compiles(), 2);

    let released = fixture.dispatch(Request::get("/db").with_param("_release", session.as_str()));
    assert_eq!(released.status, 200);
    assert!(released.body.is_empty());
    assert_eq!(fixture.dispatcher.sessions().stats().occupied, 0);
}

#[test]
fn stored_query_sees_servlet_path_and_path_info() {
    let fixture = Fixture::new();
    fixture.query("/db/apps/run.xq", "context");

    let request = Request::get("/db/apps/run.xq/extra/path").with_param("_wrap", "yes");
    let first = fixture.dispatch(request.clone());
    assert_eq!(first.status, 200);
    assert_eq!(first.header("X-XQuery-Cached"), Some("false"));
    assert_eq!(
        values(&first),
        vec![
            "docs=/db/apps",
            "module=/db/apps",
            "servlet=/db/apps/run.xq",
            "info=/extra/path",
            "method=GET",
            "user=guest",
            "adapted=true",
        ]
    );

    let second = fixture.dispatch(request);
    assert_eq!(second.header("X-XQuery-Cached"), Some("true"));
    assert_eq!(values(&second), values(&first));
    fixture.assert_no_locks_held();
}

#[test]
fn stored_query_output_is_unwrapped_by_default() {
    let fixture = Fixture::new();
    fixture.query("/db/apps/nums.xq", "range 12");
    let response = fixture.dispatch(Request::get("/db/apps/nums.xq"));
    assert_eq!(response.body_text(), "1 2 3 4 5 6 7 8 9 10 11 12");
}

#[test]
fn stored_query_failure_is_a_server_error() {
    let fixture = Fixture::new();
    fixture.query("/db/apps/broken.xq", "fail");
    let response = fixture.dispatch(Request::get("/db/apps/broken.xq"));
    assert_eq!(response.status, 500);
    assert!(response.body_text().contains("failed on purpose"));
    fixture.assert_no_locks_held();
}

#[test]
fn plain_document_stops_executable_search() {
    let fixture = Fixture::new();
    fixture.xml("/db/a/b.xml", "<b/>");
    fixture.query("/db/a.xq", "range 1");
    fixture.store.clear_probes();

    let response = fixture.dispatch(Request::get("/db/a/b.xml/extra"));
    assert_eq!(response.status, 404);
    assert_eq!(fixture.store.probes(), vec!["/db/a/b.xml/extra", "/db/a/b.xml"]);
    fixture.assert_no_locks_held();
}

#[test]
fn missing_path_without_executable_is_not_found() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(Request::get("/db/nothing/here"));
    assert_eq!(response.status, 404);
    assert!(response.body_text().contains("Document /db/nothing/here not found"));
}

#[test]
fn collection_listing_shows_children() {
    let fixture = Fixture::new();
    fixture.xml("/db/data/one.xml", "<one/>").collection("/db/data/sub");

    let response = fixture.dispatch(Request::get("/db/data"));
    assert_eq!(response.status, 200);
    let root = parse_document(&response.body_text()).unwrap();
    let collection = root.child_elements().next().unwrap();
    assert_eq!(collection.attribute("name"), Some("/db/data"));
    let children: Vec<(String, String)> = collection
        .child_elements()
        .map(|e| (e.local_name().to_string(), e.attribute("name").unwrap_or_default().to_string()))
        .collect();
    assert_eq!(
        children,
        vec![
            ("collection".to_string(), "sub".to_string()),
            ("resource".to_string(), "one.xml".to_string()),
        ]
    );
}

#[test]
fn safe_mode_forbids_listings_and_ad_hoc_queries() {
    let fixture = Fixture::with_config(Config { safe_mode: true, ..Config::default() });
    assert_eq!(fixture.dispatch(Request::get("/db")).status, 403);

    // the query parameter is ignored, so this is a listing request again
    assert_eq!(fixture.dispatch(query("range 2")).status, 403);
    assert_eq!(fixture.engine.compiles(), 0);
}

#[test]
fn disabled_submission_is_forbidden() {
    let config = Config { xquery_submission: FeatureEnabled::Disabled, ..Config::default() };
    let fixture = Fixture::with_config(config);
    assert_eq!(fixture.dispatch(query("range 2")).status, 403);

    let config = Config { xquery_submission: FeatureEnabled::AuthenticatedUsersOnly, ..Config::default() };
    let fixture = Fixture::with_config(config);
    assert_eq!(fixture.dispatch(query("range 2")).status, 403);
    let user = query("range 2").as_subject(xmlgate::core::types::Subject::user("editor"));
    assert_eq!(fixture.dispatch(user).status, 200);
}

#[test]
fn document_is_served_with_dates() {
    let fixture = Fixture::new();
    fixture.xml("/db/data/doc.xml", "<doc>text</doc>");
    fixture.binary("/db/data/notes.txt", "text/plain", b"hello");
    fixture.binary("/db/data/blob.bin", mime::BINARY, &[0, 1, 2]);

    let xml = fixture.dispatch(Request::get("/db/data/doc.xml"));
    assert_eq!(xml.status, 200);
    assert_eq!(xml.body_text(), "<doc>text</doc>");
    assert_eq!(xml.content_type(), Some("application/xml; charset=UTF-8"));
    assert_eq!(xml.header("Content-Length"), Some("15"));
    assert!(xml.header("Last-Modified").unwrap().ends_with(" GMT"));
    assert!(xml.header("Created").is_some());

    let text = fixture.dispatch(Request::get("/db/data/notes.txt").with_param("encoding", "ISO-8859-1"));
    assert_eq!(text.content_type(), Some("text/plain; charset=ISO-8859-1"));

    let blob = fixture.dispatch(Request::get("/db/data/blob.bin"));
    assert_eq!(blob.content_type(), Some(mime::BINARY));
    assert_eq!(blob.body.as_ref(), &[0u8, 1, 2]);
}

#[test]
fn if_modified_since_yields_not_modified() {
    let fixture = Fixture::new();
    fixture.xml("/db/data/doc.xml", "<doc/>");
    let first = fixture.dispatch(Request::get("/db/data/doc.xml"));
    let last_modified = first.header("Last-Modified").unwrap().to_string();

    // the rounded-up date must lie in the past to be honoured
    thread::sleep(Duration::from_millis(1100));
    let conditional = fixture.dispatch(Request::get("/db/data/doc.xml").with_header("If-Modified-Since", last_modified.as_str()));
    assert_eq!(conditional.status, 304);
    assert!(conditional.body.is_empty());

    let old = fixture.dispatch(
        Request::get("/db/data/doc.xml").with_header("If-Modified-Since", "Sun, 06 Nov 1994 08:49:37 GMT"),
    );
    assert_eq!(old.status, 200);

    let future = fixture.dispatch(
        Request::get("/db/data/doc.xml").with_header("If-Modified-Since", "Fri, 01 Jan 2100 00:00:00 GMT"),
    );
    assert_eq!(future.status, 200);

    let garbage = fixture.dispatch(Request::get("/db/data/doc.xml").with_header("If-Modified-Since", "soon"));
    assert_eq!(garbage.status, 200);
}

#[test]
fn source_is_shown_only_when_allowed() {
    let config = Config { allow_source: vec!["/db/apps/open.xq".to_string()], ..Config::default() };
    let fixture = Fixture::with_config(config);
    fixture.query("/db/apps/open.xq", "range 3").query("/db/apps/closed.xq", "range 3");

    let open = fixture.dispatch(Request::get("/db/apps/open.xq").with_param("_source", "yes"));
    assert_eq!(open.status, 200);
    assert_eq!(open.body_text(), "range 3");
    assert_eq!(open.content_type(), Some("text/plain; charset=UTF-8"));

    let closed = fixture.dispatch(Request::get("/db/apps/closed.xq").with_param("_source", "yes"));
    assert_eq!(closed.status, 403);
    assert!(closed.body_text().contains("Permission to view XQuery source for: /db/apps/closed.xq denied"));

    // no upward search when the source is requested
    let below = fixture.dispatch(Request::get("/db/apps/open.xq/x").with_param("_source", "yes"));
    assert_eq!(below.status, 404);
    assert_eq!(fixture.engine.compiles(), 0);
}

#[test]
fn head_reports_metadata_only() {
    let fixture = Fixture::new();
    fixture.xml("/db/data/doc.xml", "<doc/>");

    let doc = fixture.dispatch(Request::new(Method::Head, "/db/data/doc.xml"));
    assert_eq!(doc.status, 200);
    assert!(doc.body.is_empty());
    assert_eq!(doc.header("Content-Length"), Some("6"));
    assert_eq!(doc.content_type(), Some("application/xml; charset=UTF-8"));

    let collection = fixture.dispatch(Request::new(Method::Head, "/db/data"));
    assert_eq!(collection.content_type(), Some("application/xml; charset=UTF-8"));
    assert_eq!(collection.header("Created"), collection.header("Last-Modified"));

    let missing = fixture.dispatch(Request::new(Method::Head, "/db/data/none.xml"));
    assert_eq!(missing.status, 404);
    assert!(missing.body_text().contains("No resource at location: /db/data/none.xml"));
    fixture.assert_no_locks_held();
}

#[test]
fn post_envelope_runs_query_with_its_options() {
    let fixture = Fixture::new();
    let envelope = r#"<query xmlns="http://exist.sourceforge.net/NS/exist" start="2" max="2" cache="yes">
        <text><![CDATA[range 6]]></text>
        <properties><property name="method" value="json"/></properties>
    </query>"#;
    let response = fixture.dispatch(Request::new(Method::Post, "/db").with_body("application/xml", envelope));
    assert_eq!(response.status, 200);

    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value["data"], serde_json::json!(["2", "3"]));
    let session = response.header("X-Session-Id").unwrap();
    assert_eq!(value["session"].to_string(), session);
}

#[test]
fn post_form_body_is_handled_like_get() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(
        Request::new(Method::Post, "/db").with_body(mime::URL_ENCODED, "_query=range+4&_howmany=1"),
    );
    assert_eq!(response.status, 200);
    assert_eq!(values(&response), vec!["1"]);
}

#[test]
fn post_rejects_unusable_bodies() {
    let fixture = Fixture::new();
    let post = |body: &str| fixture.dispatch(Request::new(Method::Post, "/db").with_body("text/xml", body.to_string()));

    let unknown = post("<foo/>");
    assert_eq!(unknown.status, 400);
    assert!(unknown.body_text().contains("Unknown XML root element: foo"));

    let empty = post(r#"<exist:query xmlns:exist="http://exist.sourceforge.net/NS/exist"/>"#);
    assert_eq!(empty.status, 400);
    assert!(empty.body_text().contains("No query specified"));

    assert_eq!(post("<unclosed>").status, 400);
}

#[test]
fn post_to_stored_query_executes_it() {
    let fixture = Fixture::new();
    fixture.query("/db/apps/run.xq", "context");
    let response = fixture.dispatch(
        Request::new(Method::Post, "/db/apps/run.xq/sub").with_body("application/xml", "<payload/>"),
    );
    assert_eq!(response.status, 200);
    assert!(response.body_text().contains("method=POST"));
    assert!(response.body_text().contains("info=/sub"));
}

#[test]
fn errors_are_html_for_browsers() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(Request::get("/db/missing.xml").with_header("Accept", "text/html,*/*"));
    assert_eq!(response.status, 404);
    assert_eq!(response.content_type(), Some("text/html; charset=UTF-8"));
    assert!(response.body_text().contains("<h1>Error found</h1>"));
}

#[test]
fn malformed_parameters_are_rejected() {
    let fixture = Fixture::new();
    let response = fixture.dispatch(query("range 2").with_param("_howmany", "lots"));
    assert_eq!(response.status, 400);
    assert!(response.body_text().contains("Parameter _howmany should be an int"));

    assert_eq!(fixture.dispatch(Request::get("/db/../etc")).status, 400);
}
