//! End-to-end handshake: a device seals a `Credential` against an
//! edge's certificate, the edge unseals it and allocates a peer id.

use tether_credential::CredentialEngine;
use tether_session::handshake;

fn edge_engine_with_certificate() -> CredentialEngine {
    let mut engine = CredentialEngine::new();
    engine.key_material_mut().generate_keypair(2048).unwrap();
    let request = tether_credential::certificate::CertificateRequest {
        subject_cn: Some("edge.local".to_string()),
        ..Default::default()
    };
    let private_key = engine.key_material().private_key().unwrap().clone();
    let cert_pem = tether_credential::certificate::self_signed(&private_key, &request).unwrap();
    engine.key_material_mut().set_certificate(&cert_pem).unwrap();
    engine
}

#[test]
fn secured_handshake_round_trips_session_key_and_nonce() {
    let mut device_engine = CredentialEngine::new();
    let edge_engine = edge_engine_with_certificate();
    let edge_cert_pem = String::from_utf8(edge_engine.key_material().get_certificate().unwrap()).unwrap();

    let uuid = "11111111-2222-3333-4444-555555555555";
    let (nonce, sealed) = handshake::client_seal(&mut device_engine, uuid, Some(&edge_cert_pem)).unwrap();

    let exchange = handshake::server_unseal(Some(&edge_engine), &sealed, uuid).unwrap();
    assert_eq!(exchange.nonce, nonce);

    let device_key = device_engine.key_material().get_symmetric_key(false).unwrap();
    assert_eq!(exchange.session_key, device_key);
}

#[test]
fn secured_handshake_rejects_wrong_uuid() {
    let mut device_engine = CredentialEngine::new();
    let edge_engine = edge_engine_with_certificate();
    let edge_cert_pem = String::from_utf8(edge_engine.key_material().get_certificate().unwrap()).unwrap();

    let (_, sealed) = handshake::client_seal(
        &mut device_engine,
        "11111111-2222-3333-4444-555555555555",
        Some(&edge_cert_pem),
    )
    .unwrap();

    let result = handshake::server_unseal(
        Some(&edge_engine),
        &sealed,
        "00000000-0000-0000-0000-000000000000",
    );
    assert!(result.is_err());
}

#[test]
fn insecure_handshake_skips_encryption_when_neither_side_is_authenticated() {
    let mut device_engine = CredentialEngine::new();
    let uuid = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
    let (_, sealed) = handshake::client_seal(&mut device_engine, uuid, None).unwrap();
    assert_eq!(sealed, handshake::INSECURE_PAYLOAD);

    let exchange = handshake::server_unseal(None, &sealed, uuid).unwrap();
    assert_eq!(exchange.session_key, device_engine.key_material().get_symmetric_key(false).unwrap());
}
