//! Certificate Factory (§4.5) — self-signed or CA-issued X.509 v3
//! certificates over an already-generated RSA keypair.

use crate::error::Error;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};

/// Defaulting rules from §4.5: non-positive inputs fall back to these.
pub const DEFAULT_SERIAL: i64 = 1;
pub const DEFAULT_DAYS: i64 = 365;

/// An issuer credential used to sign a subordinate (end-entity) certificate.
pub struct Issuer<'a> {
    pub private_key: &'a RsaPrivateKey,
    pub certificate_pem: &'a str,
}

/// Inputs to certificate generation, mirroring §4.5's parameter table.
pub struct CertificateRequest {
    pub serial: i64,
    pub days: i64,
    pub is_ca: bool,
    pub alternative_name: Option<String>,
    pub subject_cn: Option<String>,
}

impl Default for CertificateRequest {
    fn default() -> Self {
        Self {
            serial: DEFAULT_SERIAL,
            days: DEFAULT_DAYS,
            is_ca: true,
            alternative_name: None,
            subject_cn: None,
        }
    }
}

impl CertificateRequest {
    /// Apply the §4.5 tie-break defaults to caller-supplied values.
    pub fn normalized(serial: i64, days: i64, is_ca: i32) -> (i64, i64, bool) {
        let serial = if serial <= 0 { DEFAULT_SERIAL } else { serial };
        let days = if days <= 0 { DEFAULT_DAYS } else { days };
        let is_ca = if is_ca < 0 { true } else { is_ca != 0 };
        (serial, days, is_ca)
    }
}

fn rsa_key_pair(key: &RsaPrivateKey) -> Result<KeyPair, Error> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| Error::CryptoFault(format!("PKCS#8 encoding of RSA key failed: {e}")))?;
    let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());
    KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| Error::CryptoFault(format!("loading RSA key into certificate builder failed: {e}")))
}

fn build_params(subject_key: &KeyPair, request: &CertificateRequest) -> Result<CertificateParams, Error> {
    let sans = match &request.alternative_name {
        Some(ip) => vec![ip.clone()],
        None => vec![],
    };
    let mut params = CertificateParams::new(sans)
        .map_err(|e| Error::InvalidArgument(format!("invalid alternative name: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "KR");
    dn.push(DnType::OrganizationName, "BeyonD");
    if request.is_ca {
        dn.push(DnType::CommonName, "beyond.net");
    } else {
        dn.push(DnType::CommonName, request.subject_cn.clone().unwrap_or_else(|| "edge.beyond.net".to_string()));
        dn.push(DnType::OrganizationalUnitName, "Inference");
    }
    params.distinguished_name = dn;

    params.serial_number = Some(SerialNumber::from(request.serial.to_be_bytes().to_vec()));
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(request.days);
    params.key_identifier_method = KeyIdMethod::Sha256;

    if request.is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params
            .custom_extensions
            .push(netscape_cert_type_extension(NetscapeCertType::Ca));
    } else {
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::NonRepudiation,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
    }

    if let Some(ip) = &request.alternative_name {
        if let Ok(addr) = ip.parse() {
            params.subject_alt_names = vec![SanType::IpAddress(addr)];
        }
    }

    let _ = subject_key; // key itself is supplied at signing time
    Ok(params)
}

/// A self-signed certificate (no issuer) over `subject_key`.
pub fn self_signed(subject_key: &RsaPrivateKey, request: &CertificateRequest) -> Result<String, Error> {
    let key_pair = rsa_key_pair(subject_key)?;
    let params = build_params(&key_pair, request)?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::CryptoFault(format!("self-signing certificate failed: {e}")))?;
    Ok(cert.pem())
}

/// A subordinate certificate over `subject_key`, signed by `issuer`.
pub fn issued_by(
    subject_key: &RsaPrivateKey,
    request: &CertificateRequest,
    issuer: Issuer<'_>,
) -> Result<String, Error> {
    let subject_key_pair = rsa_key_pair(subject_key)?;
    let params = build_params(&subject_key_pair, request)?;

    let issuer_key_pair = rsa_key_pair(issuer.private_key)?;
    let issuer_params = rcgen::CertificateParams::from_ca_cert_pem(issuer.certificate_pem)
        .map_err(|e| Error::InvalidArgument(format!("invalid issuer certificate: {e}")))?;
    let issuer_cert = issuer_params
        .self_signed(&issuer_key_pair)
        .map_err(|e| Error::CryptoFault(format!("re-deriving issuer certificate failed: {e}")))?;

    let cert = params
        .signed_by(&subject_key_pair, &issuer_cert, &issuer_key_pair)
        .map_err(|e| Error::CryptoFault(format!("issuing subordinate certificate failed: {e}")))?;
    Ok(cert.pem())
}

enum NetscapeCertType {
    Ca,
}

/// Netscape Certificate Type extension (OID 2.16.840.1.113730.1.1), a
/// legacy bitstring extension the spec still asks CA certs to carry:
/// `sslCA,emailCA,objCA` — bits 5 (SSL CA), 6 (S/MIME CA), 7 (Object
/// Signing CA).
fn netscape_cert_type_extension(kind: NetscapeCertType) -> rcgen::CustomExtension {
    let bits: u8 = match kind {
        NetscapeCertType::Ca => 0b0000_0111, // sslCA | emailCA | objCA, MSB-first bit numbering
    };
    // DER BIT STRING: tag 0x03, length 2, unused-bits 0, payload byte.
    let der = vec![0x03, 0x02, 0x00, bits];
    rcgen::CustomExtension::from_oid_content(&[2, 16, 840, 1, 113730, 1, 1], der)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RsaPrivateKey {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    }

    #[test]
    fn self_signed_root_contains_expected_subject() {
        let k = key();
        let request = CertificateRequest {
            is_ca: true,
            ..Default::default()
        };
        let pem = self_signed(&k, &request).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn end_entity_issued_by_ca() {
        let ca_key = key();
        let ca_request = CertificateRequest {
            is_ca: true,
            ..Default::default()
        };
        let ca_pem = self_signed(&ca_key, &ca_request).unwrap();

        let ee_key = key();
        let ee_request = CertificateRequest {
            is_ca: false,
            subject_cn: Some("edge.beyond.net".to_string()),
            ..Default::default()
        };
        let ee_pem = issued_by(
            &ee_key,
            &ee_request,
            Issuer {
                private_key: &ca_key,
                certificate_pem: &ca_pem,
            },
        )
        .unwrap();
        assert!(ee_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn defaults_apply_for_non_positive_inputs() {
        let (serial, days, is_ca) = CertificateRequest::normalized(0, -5, -1);
        assert_eq!(serial, DEFAULT_SERIAL);
        assert_eq!(days, DEFAULT_DAYS);
        assert!(is_ca);
    }
}
