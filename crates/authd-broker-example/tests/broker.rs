#![allow(missing_docs)]

use authd_broker_example::{ExampleBroker, PASSWORD, PIN};
use authd_core::{AuthResponse, AuthenticationItem, Broker, BrokerErrorKind, SessionInfo, UiLayout};
use base64::{Engine, engine::general_purpose::STANDARD};
use pretty_assertions::assert_eq;
use rsa::{Oaep, RsaPublicKey, pkcs8::DecodePublicKey};
use rstest::rstest;
use sha2::Sha512;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn challenge(session: &SessionInfo, secret: &str) -> AuthenticationItem {
    let der = STANDARD.decode(&session.encryption_key).unwrap();
    let key = RsaPublicKey::from_public_key_der(&der).unwrap();
    let ciphertext = key.encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha512>(), secret.as_bytes()).unwrap();
    AuthenticationItem::Challenge(STANDARD.encode(ciphertext))
}

fn all_layouts() -> Vec<UiLayout> {
    ["form", "qrcode", "newpassword"].into_iter().map(UiLayout::new).collect()
}

async fn submit(broker: &ExampleBroker, session: &SessionInfo, item: AuthenticationItem) -> AuthResponse {
    broker
        .submit_authentication(&session.session_id, &item, CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn lists_itself_and_the_local_broker() {
    let broker = ExampleBroker::new().unwrap();
    let ids: Vec<String> = broker.list_brokers().await.unwrap().into_iter().map(|b| b.id).collect();
    assert_eq!(ids, vec!["example".to_string(), "local".to_string()]);
}

#[tokio::test]
async fn modes_are_filtered_by_supported_layouts() {
    let broker = ExampleBroker::new().unwrap();
    let session = broker.start_session("example", "alice", "C").await.unwrap();

    let all: Vec<String> = broker
        .list_auth_modes(&session.session_id, &all_layouts())
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(all, vec!["password", "pincode", "phoneack", "qrcode"]);

    let forms = broker.list_auth_modes(&session.session_id, &[UiLayout::new("form")]).await.unwrap();
    assert_eq!(forms.len(), 3);
}

#[rstest]
#[case::password("password", PASSWORD)]
#[case::pin("pincode", PIN)]
#[tokio::test]
async fn right_secret_is_granted(#[case] mode: &str, #[case] secret: &str) {
    let broker = ExampleBroker::new().unwrap();
    let session = broker.start_session("example", "alice", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, mode).await.unwrap();

    let response = submit(&broker, &session, challenge(&session, secret)).await;
    assert_eq!(response, AuthResponse::new("granted", r#"{"message":"Welcome, alice"}"#));
}

#[tokio::test]
async fn retry_budget_ends_in_denial() {
    let broker = ExampleBroker::new().unwrap().with_max_attempts(2);
    let session = broker.start_session("example", "alice", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, "password").await.unwrap();

    let first = submit(&broker, &session, challenge(&session, "nope")).await;
    assert_eq!(first, AuthResponse::new("retry", r#"{"message":"Invalid secret, 1 attempts left"}"#));
    let second = submit(&broker, &session, challenge(&session, "nope")).await;
    assert_eq!(second, AuthResponse::new("denied", ""));
}

#[tokio::test]
async fn mfa_users_need_a_second_factor() {
    let broker = ExampleBroker::new().unwrap();
    let session = broker.start_session("example", "user-mfa-bob", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, "password").await.unwrap();

    let response = submit(&broker, &session, challenge(&session, PASSWORD)).await;
    assert_eq!(response.access, "next");

    let modes = broker.list_auth_modes(&session.session_id, &all_layouts()).await.unwrap();
    assert_eq!(modes.into_iter().map(|m| m.id).collect::<Vec<_>>(), vec!["pincode"]);
    broker.select_auth_mode(&session.session_id, "pincode").await.unwrap();
    assert_eq!(submit(&broker, &session, challenge(&session, PIN)).await.access, "granted");
}

#[tokio::test]
async fn password_reset_can_be_skipped() {
    let broker = ExampleBroker::new().unwrap();
    let session = broker.start_session("example", "user-needs-reset-carol", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, "password").await.unwrap();
    assert_eq!(submit(&broker, &session, challenge(&session, PASSWORD)).await.access, "next");

    broker.select_auth_mode(&session.session_id, "newpassword").await.unwrap();
    let empty = submit(&broker, &session, challenge(&session, "")).await;
    assert_eq!(empty.access, "retry");
    let skipped = submit(&broker, &session, AuthenticationItem::Skip("true".into())).await;
    assert_eq!(skipped.access, "granted");
}

#[tokio::test]
async fn waiting_mode_is_acknowledged_unless_cancelled() {
    let broker = ExampleBroker::new().unwrap().with_ack_delay(Duration::from_millis(5));
    let session = broker.start_session("example", "alice", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, "phoneack").await.unwrap();
    assert_eq!(submit(&broker, &session, AuthenticationItem::Wait("true".into())).await.access, "granted");

    let broker = broker.with_ack_delay(Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });
    let response = broker
        .submit_authentication(&session.session_id, &AuthenticationItem::Wait("true".into()), cancel)
        .await
        .unwrap();
    assert_eq!(response.access, "cancelled");
}

#[tokio::test]
async fn concurrent_submissions_are_rejected() {
    let broker = Arc::new(ExampleBroker::new().unwrap().with_challenge_delay(Duration::from_millis(100)));
    let session = broker.start_session("example", "alice", "C").await.unwrap();
    broker.select_auth_mode(&session.session_id, "password").await.unwrap();

    let first = {
        let broker = broker.clone();
        let session = session.clone();
        let item = challenge(&session, PASSWORD);
        tokio::spawn(async move { broker.submit_authentication(&session.session_id, &item, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = broker
        .submit_authentication(&session.session_id, &challenge(&session, PASSWORD), CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BrokerErrorKind::InvalidState);
    assert_eq!(first.await.unwrap().unwrap().access, "granted");
    assert_eq!(broker.max_concurrent_submissions(), 1);
}

#[tokio::test]
async fn sessions_and_defaults_are_recorded() {
    let broker = ExampleBroker::new().unwrap();
    assert!(broker.start_session("local", "alice", "C").await.is_err());

    let session = broker.start_session("example", "alice", "C").await.unwrap();
    assert_eq!(broker.active_sessions(), 1);
    broker.end_session(&session.session_id).await.unwrap();
    assert_eq!(broker.end_session(&session.session_id).await.unwrap_err().kind(), BrokerErrorKind::InvalidArgument);
    assert_eq!(broker.ended_sessions(), vec![session.session_id.clone()]);

    assert_eq!(broker.previous_broker("alice").await.unwrap(), None);
    broker.set_default_broker("example", "alice").await.unwrap();
    assert_eq!(broker.previous_broker("alice").await.unwrap(), Some("example".to_string()));
    assert_eq!(broker.default_brokers(), vec![("example".to_string(), "alice".to_string())]);
}
