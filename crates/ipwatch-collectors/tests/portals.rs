//! Collectors against a mock portal: login flows, status mapping, paging
//! and token handling over real HTTP.

use std::io::{Cursor, Write};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ipwatch_collectors::{
    CollectorSettings, RawPayload, RegtechCollector, SecudiumCollector, SourceCollector,
};
use ipwatch_core::{CollectedIndicator, Error, Result};

const REGTECH_LOGIN: &str = "/login/loginProcess";
const REGTECH_LIST: &str = "/fcti/securityAdvisory/advisoryList";
const SECUDIUM_LOGIN: &str = "/isap-api/loginProcess";
const SECUDIUM_LIST: &str = "/isap-api/secinfo/list/black_ip";
const SECUDIUM_DOWNLOAD: &str = "/isap-api/file/SECINFO/download";

fn settings(source: &str, server: &MockServer) -> CollectorSettings {
    CollectorSettings {
        source: source.into(),
        base_url: server.uri(),
        username: "analyst".into(),
        password: "hunter2".into(),
        timeout: Duration::from_secs(5),
    }
}

/// The blocking client must live and die off the async executor.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

async fn regtech_collect(server: &MockServer) -> Result<Vec<CollectedIndicator>> {
    let collector = RegtechCollector::new(settings("regtech", server));
    blocking(move || collector.collect()).await
}

async fn regtech_fetch(server: &MockServer) -> Result<RawPayload> {
    let collector = RegtechCollector::new(settings("regtech", server));
    blocking(move || {
        let session = collector.authenticate()?;
        collector.fetch_raw(&session)
    })
    .await
}

/// An advisory page with `rows` distinct addresses.
fn advisory_page(rows: usize) -> String {
    let mut html = String::from("<html><body><table class=\"board_list\"><tbody>");
    for i in 0..rows {
        html.push_str(&format!(
            "<tr><td>{}</td><td>198.51.{}.{}</td><td>KR</td><td>scan</td><td>2024-03-15</td><td>High</td></tr>",
            i + 1,
            i / 250,
            i % 250 + 1
        ));
    }
    html.push_str("</tbody></table></body></html>");
    html
}

const LOGIN_FORM: &str = "<html><form id=\"loginForm\"><input name=\"loginPW\"></form></html>";

async fn mount_regtech_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(REGTECH_LOGIN))
        .and(body_string_contains("loginID=analyst"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "JSESSIONID=abc123; Path=/")
                .set_body_string("<html>main</html>"),
        )
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_collects_with_session_cookie() {
    let server = MockServer::start().await;
    mount_regtech_login(&server).await;
    Mock::given(method("GET"))
        .and(path(REGTECH_LIST))
        .and(query_param("page", "1"))
        .and(header("cookie", "JSESSIONID=abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_string(advisory_page(2)))
        .expect(1)
        .mount(&server)
        .await;

    let batch = regtech_collect(&server).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|i| i.confidence == 0.9));
    assert_eq!(batch[0].metadata["country"], "KR");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_rejected_status_is_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REGTECH_LOGIN))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = regtech_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_login_form_again_is_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REGTECH_LOGIN))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_FORM))
        .mount(&server)
        .await;

    let err = regtech_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(msg) if msg.contains("rejected")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_session_expiry_while_paging() {
    let server = MockServer::start().await;
    mount_regtech_login(&server).await;
    Mock::given(method("GET"))
        .and(path(REGTECH_LIST))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(advisory_page(100)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(REGTECH_LIST))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_FORM))
        .mount(&server)
        .await;

    let err = regtech_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(msg) if msg.contains("session expired")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_paging_stops_at_page_limit() {
    let server = MockServer::start().await;
    mount_regtech_login(&server).await;
    Mock::given(method("GET"))
        .and(path(REGTECH_LIST))
        .respond_with(ResponseTemplate::new(200).set_body_string(advisory_page(100)))
        .expect(50)
        .mount(&server)
        .await;

    match regtech_fetch(&server).await.unwrap() {
        RawPayload::HtmlPages(pages) => assert_eq!(pages.len(), 50),
        other => panic!("expected html pages, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_regtech_server_error_is_transport() {
    let server = MockServer::start().await;
    mount_regtech_login(&server).await;
    Mock::given(method("GET"))
        .and(path(REGTECH_LIST))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = regtech_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{:?}", err);
}

fn export_workbook() -> Vec<u8> {
    let sheet = r#"<worksheet><sheetData>
<row r="1"><c r="A1" t="inlineStr"><is><t>IP</t></is></c><c r="B1" t="inlineStr"><is><t>탐지일시</t></is></c><c r="C1" t="inlineStr"><is><t>위험도</t></is></c></row>
<row r="2"><c r="A2" t="inlineStr"><is><t>203.0.113.9</t></is></c><c r="B2" t="inlineStr"><is><t>2024-03-15</t></is></c><c r="C2" t="inlineStr"><is><t>높음</t></is></c></row>
<row r="3"><c r="A3" t="inlineStr"><is><t>203.0.113.10</t></is></c><c r="B3" t="inlineStr"><is><t>2024-03-14</t></is></c></row>
</sheetData></worksheet>"#;
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("xl/worksheets/sheet1.xml", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(sheet.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

async fn mount_secudium_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(SECUDIUM_LOGIN))
        .and(body_string_contains("login_name=analyst"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-1" })))
        .mount(server)
        .await;
}

async fn secudium_collect(server: &MockServer) -> Result<Vec<CollectedIndicator>> {
    let collector = SecudiumCollector::new(settings("secudium", server));
    blocking(move || collector.collect()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_secudium_downloads_latest_export_with_token() {
    let server = MockServer::start().await;
    mount_secudium_login(&server).await;
    Mock::given(method("GET"))
        .and(path(SECUDIUM_LIST))
        .and(header("X-Auth-Token", "tok-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "content": [{ "fileIdx": 7 }, { "fileIdx": 6 }] })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(SECUDIUM_DOWNLOAD))
        .and(query_param("fileIdx", "7"))
        .and(header("X-Auth-Token", "tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(export_workbook()))
        .expect(1)
        .mount(&server)
        .await;

    let batch = secudium_collect(&server).await.unwrap();
    assert_eq!(batch.len(), 2);
    let first = batch.iter().find(|i| i.ip == "203.0.113.9").unwrap();
    assert_eq!(first.confidence, 0.9);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_secudium_login_error_is_authentication() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SECUDIUM_LOGIN))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "error": true, "message": "bad password" })),
        )
        .mount(&server)
        .await;

    let err = secudium_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(msg) if msg == "bad password"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_secudium_forbidden_listing_is_authentication() {
    let server = MockServer::start().await;
    mount_secudium_login(&server).await;
    Mock::given(method("GET"))
        .and(path(SECUDIUM_LIST))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let err = secudium_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_secudium_non_workbook_download_is_parse_error() {
    let server = MockServer::start().await;
    mount_secudium_login(&server).await;
    Mock::given(method("GET"))
        .and(path(SECUDIUM_LIST))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "content": [{ "fileIdx": "9" }] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(SECUDIUM_DOWNLOAD))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>session timed out</html>"))
        .mount(&server)
        .await;

    let err = secudium_collect(&server).await.unwrap_err();
    assert!(matches!(err, Error::Parse(msg) if msg.contains("not an xlsx")));
}
