//! End-to-end header extraction, generation, and filtering.

mod support;

use support::*;

#[tokio::test]
async fn propagates_declared_header_to_upstream() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send("GET", "/", &[("x-request-id", "abc123")])
        .await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 200"), "{rsp}");

    let seen = upstream.next().await;
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.header("x-request-id"), Some("abc123"));
}

#[tokio::test]
async fn emits_canonical_header_case_on_the_wire() {
    let (upstream_addr, mut heads) = spawn_raw_upstream().await;
    let proxy = spawn_proxy(upstream_addr, r#"[{"name":"X-Request-ID"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send("GET", "/", &[("x-request-id", "abc123")])
        .await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 200"), "{rsp}");

    let head = heads.recv().await.expect("upstream saw a request");
    assert!(
        head.contains("X-Request-Id: abc123"),
        "expected canonical case in request head:\n{head}"
    );
}

#[tokio::test]
async fn generates_uuid_when_header_absent() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-request-id","generate":true,"generatorType":"uuid"}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client.send("GET", "/", &[]).await;
    client.read_response().await;

    let seen = upstream.next().await;
    let value = seen.header("x-request-id").expect("header was generated");
    assert_eq!(value.len(), 36, "{value}");
    let bytes = value.as_bytes();
    assert_eq!(bytes[14], b'4', "{value}");
    assert!(matches!(bytes[19], b'8' | b'9' | b'a' | b'b'), "{value}");
    assert!(
        value
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase() || c == '-'),
        "{value}"
    );
}

#[tokio::test]
async fn generates_ulid_and_timestamp_formats() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-trace-id","generate":true,"generatorType":"ulid"},
            {"name":"x-received-at","generate":true,"generatorType":"timestamp"}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client.send("GET", "/", &[]).await;
    client.read_response().await;

    let seen = upstream.next().await;
    let ulid = seen.header("x-trace-id").expect("ulid was generated");
    assert_eq!(ulid.len(), 26, "{ulid}");
    assert!(
        ulid.bytes()
            .all(|b| b"0123456789ABCDEFGHJKMNPQRSTVWXYZ".contains(&b)),
        "{ulid}"
    );

    let ts = seen.header("x-received-at").expect("timestamp was generated");
    chrono::DateTime::parse_from_rfc3339(ts).expect("timestamp must be RFC 3339");
}

#[tokio::test]
async fn does_not_generate_when_header_present() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-request-id","generate":true,"generatorType":"uuid"}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send("GET", "/", &[("x-request-id", "caller-chose-this")])
        .await;
    client.read_response().await;

    let seen = upstream.next().await;
    assert_eq!(seen.header("x-request-id"), Some("caller-chose-this"));
}

#[tokio::test]
async fn method_filter_scopes_propagation() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-csrf-token","methods":["POST","PUT","DELETE","PATCH"]}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send("POST", "/submit", &[("x-csrf-token", "t1"), ("content-length", "0")])
        .await;
    client.read_response().await;
    let seen = upstream.next().await;
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.header("x-csrf-token"), Some("t1"));

    // The rule does not match GET; the scope stays empty. The header
    // still reaches the app on the reverse path because inbound headers
    // are forwarded as-is, so assert through the forward-proxy path
    // where only the scope is injected.
    let mut remote = spawn_upstream().await;
    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send(
            "GET",
            &format!("http://127.0.0.1:{}/fetch", remote.addr.port()),
            &[],
        )
        .await;
    client.read_response().await;
    let seen = remote.next().await;
    assert_eq!(seen.header("x-csrf-token"), None);
}

#[tokio::test]
async fn path_filter_scopes_propagation() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-api-key","generate":true,"generatorType":"uuid","pathRegex":"^/api/.*"}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client.send("GET", "/health-page", &[]).await;
    client.read_response().await;
    let seen = upstream.next().await;
    assert_eq!(seen.header("x-api-key"), None, "rule must not match /health-page");

    client.send("GET", "/api/x", &[]).await;
    client.read_response().await;
    let seen = upstream.next().await;
    assert!(seen.header("x-api-key").is_some(), "rule must match /api/x");
}

#[tokio::test]
async fn forward_proxies_absolute_form_requests() {
    let upstream = spawn_upstream().await;
    let mut remote = spawn_upstream().await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send(
            "GET",
            &format!("http://127.0.0.1:{}/api/data?q=1", remote.addr.port()),
            &[("x-request-id", "outbound-1"), ("Host", "stale.example")],
        )
        .await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 200"), "{rsp}");

    let seen = remote.next().await;
    assert_eq!(seen.path, "/api/data");
    assert_eq!(seen.header("x-request-id"), Some("outbound-1"));
    // The absolute-form authority replaces the stale Host header.
    assert_eq!(
        seen.header("host"),
        Some(format!("127.0.0.1:{}", remote.addr.port()).as_str())
    );
}

#[tokio::test]
async fn generates_on_the_forward_path_too() {
    let upstream = spawn_upstream().await;
    let mut remote = spawn_upstream().await;
    let proxy = spawn_proxy(
        upstream.addr,
        r#"[{"name":"x-request-id","generate":true,"generatorType":"uuid"}]"#,
    )
    .await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send(
            "GET",
            &format!("http://127.0.0.1:{}/", remote.addr.port()),
            &[],
        )
        .await;
    client.read_response().await;

    let seen = remote.next().await;
    let value = seen.header("x-request-id").expect("header was generated");
    assert_eq!(value.len(), 36);
}

#[tokio::test]
async fn preserves_method_path_query_and_body() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client.send("DELETE", "/v1/items/42?force=true", &[]).await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 200"), "{rsp}");
    assert!(rsp.ends_with("OK"), "body must stream back: {rsp}");

    let seen = upstream.next().await;
    assert_eq!(seen.method, "DELETE");
    assert_eq!(seen.path, "/v1/items/42");
}

#[tokio::test]
async fn streams_request_bodies_to_the_upstream() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let payload = "field=value&count=3";
    let mut client = RawClient::connect(proxy.addr).await;
    client
        .write_raw(
            format!(
                "POST /submit HTTP/1.1\r\nHost: app.test\r\nX-Request-Id: with-body\r\n\
                 Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{payload}",
                payload.len(),
            )
            .as_bytes(),
        )
        .await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 200"), "{rsp}");

    let seen = upstream.next().await;
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.body, payload);
    assert_eq!(seen.header("x-request-id"), Some("with-body"));
    assert_eq!(
        seen.header("content-type"),
        Some("application/x-www-form-urlencoded")
    );
}

#[tokio::test]
async fn upstream_statuses_and_bodies_pass_through_verbatim() {
    use http::StatusCode;
    use std::time::Duration;

    let mut upstream = spawn_upstream_responding(
        StatusCode::IM_A_TEAPOT,
        "short and stout",
        Duration::ZERO,
    )
    .await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client.send("GET", "/brew", &[]).await;
    let rsp = client.read_response().await;
    assert!(rsp.starts_with("HTTP/1.1 418"), "{rsp}");
    assert!(rsp.ends_with("short and stout"), "{rsp}");
    upstream.next().await;
}

#[tokio::test]
async fn strips_hop_by_hop_headers() {
    let mut upstream = spawn_upstream().await;
    let proxy = spawn_proxy(upstream.addr, r#"[{"name":"x-request-id"}]"#).await;

    let mut client = RawClient::connect(proxy.addr).await;
    client
        .send(
            "GET",
            "/",
            &[
                ("connection", "x-conn-secret"),
                ("x-conn-secret", "do-not-forward"),
                ("proxy-connection", "keep-alive"),
                ("x-request-id", "keep"),
            ],
        )
        .await;
    client.read_response().await;

    let seen = upstream.next().await;
    assert_eq!(seen.header("x-conn-secret"), None);
    assert_eq!(seen.header("proxy-connection"), None);
    assert_eq!(seen.header("x-request-id"), Some("keep"));
}
