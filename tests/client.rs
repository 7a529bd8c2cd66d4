use harbor::{Body, ErrorKind, Session};
use harbor_mocks::MockServer;

#[tokio::test]
async fn headers_are_echoed_with_host() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session
        .get(server.url("/headers"))
        .header("Test-Header", "it works")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    let payload: serde_json::Value = res.json().unwrap();
    let headers = &payload["headers"];
    assert_eq!(
        headers["Host"],
        format!("127.0.0.1:{}", server.addr().port())
    );
    assert_eq!(headers["Test-Header"], "it works");
}

#[tokio::test]
async fn query_arguments_are_echoed() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session
        .get(server.url("/get?alpha=1&beta=two"))
        .send()
        .await
        .unwrap();

    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["args"]["alpha"], "1");
    assert_eq!(payload["args"]["beta"], "two");
}

#[tokio::test]
async fn form_post_round_trips() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session
        .post(server.url("/post"))
        .form(&[("foo", "42"), ("bar", "21"), ("foo bar", "23")])
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), 200);
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(
        payload["headers"]["Content-Type"],
        "application/x-www-form-urlencoded"
    );
    assert_eq!(payload["form"]["foo"], "42");
    assert_eq!(payload["form"]["bar"], "21");
    assert_eq!(payload["form"]["foo bar"], "23");
}

#[cfg(feature = "json")]
#[tokio::test]
async fn json_post_sets_content_type() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session
        .post(server.url("/post"))
        .json(&serde_json::json!({"k": "v"}))
        .send()
        .await
        .unwrap();

    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["headers"]["Content-Type"], "application/json");
    assert_eq!(payload["data"], "{\"k\":\"v\"}");
}

#[tokio::test]
async fn default_user_agent_is_sent_and_overridable() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session.get(server.url("/headers")).send().await.unwrap();
    let payload: serde_json::Value = res.json().unwrap();
    let agent = payload["headers"]["User-Agent"].as_str().unwrap();
    assert!(agent.starts_with("harbor/"));

    let res = session
        .get(server.url("/headers"))
        .header("User-Agent", "custom-agent/1")
        .send()
        .await
        .unwrap();
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["headers"]["User-Agent"], "custom-agent/1");
}

#[tokio::test]
async fn streaming_reads_body_incrementally() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let mut stream = session
        .get(server.url("/drip?numbytes=64&chunks=4&delay_ms=5"))
        .ropen()
        .await
        .unwrap();

    assert_eq!(stream.status(), 200);
    let mut total = 0;
    let mut buf = [0u8; 7];
    loop {
        let n = stream.read_some(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        assert!(buf[..n].iter().all(|&b| b == b'*'));
        total += n;
    }
    assert_eq!(total, 64);
    assert!(stream.done());
}

#[tokio::test]
async fn until_close_bodies_are_read_to_eof() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session.get(server.url("/until-close")).send().await.unwrap();
    assert_eq!(res.text().unwrap(), "raw body until close");
}

#[tokio::test]
async fn interim_responses_are_skipped() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session.get(server.url("/interim")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.text().unwrap(), "final");
}

#[tokio::test]
async fn head_requests_have_no_body() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let res = session.head(server.url("/get")).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert!(res.bytes().is_empty());
}

#[tokio::test]
async fn conflicting_framing_is_a_protocol_error() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let err = session
        .get(server.url("/both-framing"))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);

    // The session survives; the next request opens a fresh connection.
    let res = session.get(server.url("/get")).send().await.unwrap();
    assert_eq!(res.status(), 200);
}

#[tokio::test]
async fn oversized_head_is_rejected() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let err = session
        .get(server.url("/big-head"))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
}

#[tokio::test]
async fn body_read_timeout_fires() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let err = session
        .get(server.url("/delay-body/2000"))
        .timeout(std::time::Duration::from_millis(100))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn response_size_cap_applies_to_read_all() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    let err = session
        .get(server.url("/drip?numbytes=256&chunks=2&delay_ms=0"))
        .max_response_size(16)
        .send()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BodyTooLarge);
}

#[tokio::test]
async fn cookies_are_stored_and_returned() {
    let server = MockServer::spawn().await;
    let session = Session::new();

    // /cookies/set stores the cookie and redirects to /cookies, which
    // echoes what the client sent on the second hop.
    let res = session
        .get(server.url("/cookies/set?flavor=oatmeal"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["cookies"]["flavor"], "oatmeal");

    let jar = session.cookie_jar().unwrap();
    assert_eq!(jar.len(), 1);
}

#[tokio::test]
async fn free_functions_use_the_default_session() {
    let server = MockServer::spawn().await;
    harbor::reset_default_session();

    let res = harbor::get(server.url("/get")).await.unwrap();
    assert_eq!(res.status(), 200);

    let res = harbor::post(server.url("/post"), Body::form(&[("a", "1")]))
        .await
        .unwrap();
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["form"]["a"], "1");

    harbor::reset_default_session();
}
