//! Tests for the discovery sources
//!
//! This module tests the concrete source parsers against mocked upstream
//! endpoints, plus the registry's swallow-and-dedupe aggregation.

use std::sync::Arc;
use std::time::Duration;

use proxy_pool::sources::{
    CustomSource, FreeProxyListSource, GeonodeSource, ProxyScrapeSource, ProxySource,
    SourceRegistry,
};
use proxy_pool::{AnonymityLevel, HttpClient, ProxyProtocol};

// ============================================================================
// Fixtures
// ============================================================================

fn client() -> Arc<HttpClient> {
    Arc::new(HttpClient::new(Duration::from_secs(5)).unwrap())
}

const FREE_PROXY_LIST_PAGE: &str = r#"
<html><body>
<table class="table">
  <tbody>
    <tr><td>1.2.3.4</td><td>8080</td><td>US</td><td>United States</td><td>elite proxy</td><td>no</td><td>yes</td><td>1 min ago</td></tr>
    <tr><td>5.6.7.8</td><td>3128</td><td>DE</td><td>Germany</td><td>anonymous</td><td>no</td><td>no</td><td>2 mins ago</td></tr>
    <tr><td>bad-row</td><td>notaport</td><td></td><td></td><td></td><td></td><td></td><td></td></tr>
  </tbody>
</table>
</body></html>
"#;

const GEONODE_PAYLOAD: &str = r#"{
  "data": [
    {
      "ip": "9.9.9.9",
      "port": "1080",
      "country": "nl",
      "anonymityLevel": "elite",
      "protocols": ["socks5"],
      "isp": "ExampleNet",
      "speed": 12.5
    },
    {
      "ip": "8.8.8.8",
      "port": "443",
      "country": "US",
      "anonymityLevel": "anonymous",
      "protocols": ["https"]
    },
    {
      "ip": "7.7.7.7",
      "port": "80",
      "protocols": ["unknown-protocol"]
    }
  ]
}"#;

// ============================================================================
// Parsers
// ============================================================================

#[tokio::test]
async fn free_proxy_list_parses_table_rows() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/")
        .with_status(200)
        .with_body(FREE_PROXY_LIST_PAGE)
        .create_async()
        .await;

    let source = FreeProxyListSource::new(client()).with_url(server.url());
    assert!(source.last_updated().is_none());

    let proxies = source.fetch().await.unwrap();
    mock.assert_async().await;
    assert_eq!(proxies.len(), 2);

    assert_eq!(proxies[0].ip, "1.2.3.4");
    assert_eq!(proxies[0].port, 8080);
    assert_eq!(proxies[0].protocol, ProxyProtocol::Https);
    assert_eq!(proxies[0].country_code.as_deref(), Some("US"));
    assert_eq!(proxies[0].anonymity_level, Some(AnonymityLevel::Elite));

    assert_eq!(proxies[1].protocol, ProxyProtocol::Http);
    assert_eq!(proxies[1].anonymity_level, Some(AnonymityLevel::Anonymous));
    assert!(source.last_updated().is_some());
}

#[tokio::test]
async fn geonode_parses_api_payload() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/proxy-list")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(GEONODE_PAYLOAD)
        .create_async()
        .await;

    let source = GeonodeSource::new(client()).with_url(format!("{}/api/proxy-list", server.url()));
    let proxies = source.fetch().await.unwrap();

    // The unknown-protocol entry is skipped.
    assert_eq!(proxies.len(), 2);
    assert_eq!(proxies[0].ip, "9.9.9.9");
    assert_eq!(proxies[0].protocol, ProxyProtocol::Socks5);
    assert_eq!(proxies[0].country_code.as_deref(), Some("NL"));
    assert_eq!(proxies[0].isp.as_deref(), Some("ExampleNet"));
    assert_eq!(proxies[0].speed_mbps, Some(12.5));
    assert_eq!(proxies[1].protocol, ProxyProtocol::Https);
}

#[tokio::test]
async fn proxyscrape_parses_plain_lines() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/list")
        .with_status(200)
        .with_body("1.1.1.1:80\r\n2.2.2.2:8080\r\n\r\ngarbage\n")
        .create_async()
        .await;

    let source = ProxyScrapeSource::new(client()).with_url(format!("{}/list", server.url()));
    let proxies = source.fetch().await.unwrap();
    assert_eq!(proxies.len(), 2);
    assert!(proxies.iter().all(|p| p.protocol == ProxyProtocol::Http));
}

#[tokio::test]
async fn custom_source_uses_declared_protocol() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/mine")
        .with_status(200)
        .with_body("3.3.3.3:1080\n")
        .create_async()
        .await;

    let source = CustomSource::new(client(), format!("{}/mine", server.url()), ProxyProtocol::Socks5);
    let proxies = source.fetch().await.unwrap();
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0].protocol, ProxyProtocol::Socks5);
    assert_eq!(proxies[0].effective_socks_version(), Some(5));
    assert!(source.name().starts_with("Custom("));
}

// ============================================================================
// Registry aggregation
// ============================================================================

#[tokio::test]
async fn registry_swallows_failures_and_dedupes() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/a")
        .with_status(200)
        .with_body("1.1.1.1:80\n2.2.2.2:80\n")
        .create_async()
        .await;
    server
        .mock("GET", "/b")
        .with_status(200)
        .with_body("2.2.2.2:80\n3.3.3.3:80\n")
        .create_async()
        .await;
    server
        .mock("GET", "/empty")
        .with_status(404)
        .create_async()
        .await;

    let client = client();
    let registry = SourceRegistry::from_sources(vec![
        Arc::new(CustomSource::new(client.clone(), format!("{}/a", server.url()), ProxyProtocol::Http)),
        Arc::new(CustomSource::new(client.clone(), format!("{}/b", server.url()), ProxyProtocol::Http)),
        Arc::new(CustomSource::new(client.clone(), format!("{}/empty", server.url()), ProxyProtocol::Http)),
        // Nothing listens on the discard port; this source errors out and
        // must not poison the aggregate.
        Arc::new(CustomSource::new(client.clone(), "http://127.0.0.1:9/", ProxyProtocol::Http)),
    ]);

    let merged = registry.fetch_all(Duration::from_secs(2)).await;
    let mut ips: Vec<&str> = merged.iter().map(|p| p.ip.as_str()).collect();
    ips.sort();
    assert_eq!(ips, ["1.1.1.1", "2.2.2.2", "3.3.3.3"]);
}

#[tokio::test]
async fn registry_same_endpoint_different_protocol_is_kept() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/http")
        .with_status(200)
        .with_body("1.1.1.1:1080\n")
        .create_async()
        .await;
    server
        .mock("GET", "/socks")
        .with_status(200)
        .with_body("1.1.1.1:1080\n")
        .create_async()
        .await;

    let client = client();
    let registry = SourceRegistry::from_sources(vec![
        Arc::new(CustomSource::new(client.clone(), format!("{}/http", server.url()), ProxyProtocol::Http)),
        Arc::new(CustomSource::new(client.clone(), format!("{}/socks", server.url()), ProxyProtocol::Socks5)),
    ]);

    let merged = registry.fetch_all(Duration::from_secs(5)).await;
    assert_eq!(merged.len(), 2, "distinct protocols on one endpoint are distinct proxies");
}
