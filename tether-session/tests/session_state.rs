//! Drives the Peer Session state machine's synchronous surface without a
//! live RPC channel — `activate`/`load_model`/etc. all require a
//! connected `tonic` channel, so these scenarios exercise the
//! configuration and sequencing rules a device can hit before
//! `activate` ever runs.

use tether_credential::CredentialEngine;
use tether_session::session::{InputConfig, PeerSession, PipelineConfig, SessionState};
use tether_session::Error;

fn session() -> PeerSession {
    PeerSession::new("11111111-2222-3333-4444-555555555555", CredentialEngine::new())
}

#[test]
fn configuring_input_and_pipeline_moves_idle_to_configured() {
    let mut session = session();
    assert_eq!(session.state(), SessionState::Idle);

    session.configure_input(InputConfig::Video).unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    session
        .configure_pipeline(PipelineConfig {
            framework: "tensorflow-lite".to_string(),
            accel: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(session.state(), SessionState::Configured);
}

#[test]
fn configure_ca_authenticator_is_idempotent_with_other_configuration() {
    let mut session = session();
    session.configure_ca_authenticator("-----BEGIN CERTIFICATE-----\n...").unwrap();
    session.configure_input(InputConfig::Image).unwrap();
    assert_eq!(session.state(), SessionState::Configured);
}

#[test]
fn operations_requiring_activation_fail_before_activate() {
    let mut session = session();
    assert!(matches!(session.invoke(vec![1, 2, 3], None), Err(Error::SequenceError(_))));
}

#[test]
fn destroy_is_terminal() {
    let mut session = session();
    session.destroy();
    assert_eq!(session.state(), SessionState::Destroyed);
    assert!(matches!(session.invoke(vec![1], None), Err(Error::SequenceError(_))));
}

#[tokio::test]
async fn activate_against_an_unreachable_endpoint_is_an_auth_fault() {
    let mut session = session();
    let result = session.activate("https://127.0.0.1:1", "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").await;
    assert!(matches!(result, Err(Error::AuthFault(_)) | Err(Error::InvalidArgument(_))));
}
