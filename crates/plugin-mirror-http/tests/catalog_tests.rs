use plugin_mirror::{CatalogError, CatalogSource, ProductVersion};
use plugin_mirror_http::CatalogClient;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BUILD: &str = "IC-203.7717";

async fn mount_catalog(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path("/plugins/list/"))
        .and(query_param("build", BUILD))
        .respond_with(response)
        .mount(server)
        .await;
}

fn client_for(server: &MockServer) -> CatalogClient {
    CatalogClient::new(server.uri(), "https://upstream.test/")
}

#[tokio::test]
async fn fetch_catalog_decodes_fixture() {
    let server = MockServer::start().await;
    let fixture = include_str!("fixtures/plugin_repository.xml");
    mount_catalog(
        &server,
        ResponseTemplate::new(200).set_body_raw(fixture, "application/xml"),
    )
    .await;

    let catalog = client_for(&server)
        .fetch_catalog(&ProductVersion::new(BUILD))
        .await
        .unwrap();

    let ids: Vec<&str> = catalog.entries.iter().map(|e| e.plugin_id()).collect();
    assert_eq!(
        ids,
        vec![
            "String Manipulation",
            "Key Promoter X",
            "izhangzhihao.rainbow.brackets"
        ]
    );

    let first = &catalog.entries[0];
    assert_eq!(first.version(), "8.5.203.7717.0");
    assert_eq!(first.size, Some(524288));
    assert_eq!(first.idea_version["since-build"], "203.5981");
    assert_eq!(first.idea_version["min"], "n/a");
    assert_eq!(
        first.download_url,
        "https://upstream.test/plugin/download?pluginId=String+Manipulation&version=8.5.203.7717.0"
    );
    assert_eq!(
        first.description.as_deref(),
        Some("<p>Case switching, sorting, filtering and more.</p>")
    );

    let second = &catalog.entries[1];
    assert_eq!(
        second.description.as_deref(),
        Some("Learn shortcuts & stay productive")
    );

    let rainbow = &catalog.entries[2];
    assert_eq!(rainbow.download_url, "https://cdn.example.test/rainbow-2.0.zip");

    assert_eq!(catalog.feedback.len(), 1, "entry without id should be reported");
    assert!(catalog.feedback[0].is_warning());
}

#[tokio::test]
async fn server_error_is_unreachable() {
    let server = MockServer::start().await;
    mount_catalog(&server, ResponseTemplate::new(503)).await;

    let err = client_for(&server)
        .fetch_catalog(&ProductVersion::new(BUILD))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Unreachable(ref msg) if msg.contains("503")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn not_found_is_unreachable() {
    let server = MockServer::start().await;

    let err = client_for(&server)
        .fetch_catalog(&ProductVersion::new(BUILD))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Unreachable(_)));
}

#[tokio::test]
async fn html_body_is_malformed() {
    let server = MockServer::start().await;
    mount_catalog(
        &server,
        ResponseTemplate::new(200).set_body_raw("<html><body>maintenance</body></html>", "text/html"),
    )
    .await;

    let err = client_for(&server)
        .fetch_catalog(&ProductVersion::new(BUILD))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Malformed(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn connection_refused_is_unreachable() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let err = CatalogClient::new(uri, "https://upstream.test")
        .fetch_catalog(&ProductVersion::new(BUILD))
        .await
        .unwrap_err();
    assert!(matches!(err, CatalogError::Unreachable(_)));
}

#[test]
fn list_url_encodes_build() {
    let client = CatalogClient::new("https://plugins.test/", "https://plugins.test");
    let url = client.list_url(&ProductVersion::new("IU-211.6693.111")).unwrap();
    assert_eq!(
        url.as_str(),
        "https://plugins.test/plugins/list/?build=IU-211.6693.111"
    );
}
