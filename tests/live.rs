//! Optional tests against a real httpbin-compatible deployment.
//!
//! Set `HARBOR_TEST_HTTPBIN` to an origin such as `http://localhost:8080`
//! to enable them; without it every test is a silent pass so CI stays
//! hermetic.

use harbor::Session;

fn httpbin() -> Option<String> {
    std::env::var("HARBOR_TEST_HTTPBIN")
        .ok()
        .map(|origin| origin.trim_end_matches('/').to_string())
}

#[tokio::test]
async fn live_headers_echo() {
    let Some(origin) = httpbin() else { return };
    let session = Session::new();

    let res = session
        .get(format!("{origin}/headers"))
        .header("Test-Header", "it works")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["headers"]["Test-Header"], "it works");
}

#[tokio::test]
async fn live_redirect_chain() {
    let Some(origin) = httpbin() else { return };
    let session = Session::builder().max_redirects(5).build();

    let res = session
        .get(format!("{origin}/redirect-to?url=%2Fget"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.history().len(), 1);
}

#[tokio::test]
async fn live_form_post() {
    let Some(origin) = httpbin() else { return };
    let session = Session::new();

    let res = session
        .post(format!("{origin}/post"))
        .form(&[("foo", "42"), ("bar", "21"), ("foo bar", "23")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let payload: serde_json::Value = res.json().unwrap();
    assert_eq!(payload["form"]["foo"], "42");
    assert_eq!(payload["form"]["foo bar"], "23");
}
