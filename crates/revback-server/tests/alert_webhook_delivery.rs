use hmac::{Hmac, Mac};
use sha2::Sha256;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type HmacSha256 = Hmac<Sha256>;

/// Confirms the outbound alert webhook carries the `X-RevBack-Signature`
/// header and a JSON body, matching the contract consumers are told to
/// verify against (§4.9).
#[tokio::test]
async fn posts_signed_payload_to_configured_target() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/alerts"))
        .and(header_exists("X-RevBack-Signature"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let body = r#"{"id":"evt_1","eventType":"issue.created"}"#;
    let secret = "whsec_test";
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/alerts", server.uri()))
        .header("content-type", "application/json")
        .header("X-RevBack-Signature", signature)
        .body(body)
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
}
