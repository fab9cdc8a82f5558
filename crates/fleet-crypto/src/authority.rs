//! Certificate issuance backed by a local CA.
//!
//! The worker never generates serial numbers itself: every certificate gets
//! its serial from the authority that signs it.

use std::path::Path;
use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use rand::Rng;
use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::OffsetDateTime;

use crate::CertError;

/// Backdating applied to `notBefore` so freshly issued certificates are
/// accepted by peers with slightly skewed clocks.
const NOT_BEFORE_SKEW_MINUTES: i64 = 5;

/// `id-pe-authorityInfoAccess`
const AUTHORITY_INFO_ACCESS_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];

/// DER encoding of `id-ad-ocsp` (1.3.6.1.5.5.7.48.1), tag and length included.
const OCSP_ACCESS_METHOD: &[u8] = &[0x06, 0x08, 0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];

/// How the issued certificate may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageProfile {
    /// TLS client authentication (console users).
    Client,
    /// TLS server authentication (agent services).
    Server,
}

/// Distinguished-name attributes copied into the certificate subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectTemplate {
    pub common_name: String,
    pub organization: Option<String>,
    pub country: Option<String>,
    pub province: Option<String>,
    pub locality: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
}

/// Validity window measured from the moment of issuance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validity {
    pub years: u32,
    pub months: u32,
    pub days: u32,
}

impl Validity {
    /// Compute the expiry instant for a certificate issued at `from`.
    pub fn expires_at(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, CertError> {
        let months = self
            .years
            .checked_mul(12)
            .and_then(|m| m.checked_add(self.months))
            .ok_or_else(|| CertError::Generation("validity window overflows".into()))?;
        from.checked_add_months(Months::new(months))
            .and_then(|t| t.checked_add_days(Days::new(u64::from(self.days))))
            .ok_or_else(|| CertError::Generation("validity window overflows".into()))
    }
}

/// Everything needed to issue one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub subject: SubjectTemplate,
    pub dns_names: Vec<String>,
    pub usage: UsageProfile,
    pub validity: Validity,
    pub ocsp_responders: Vec<String>,
}

/// A signed certificate together with its freshly generated private key.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Decimal serial number assigned by the authority.
    pub serial: String,
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
    /// PKCS#8 DER private key.
    pub key_der: Vec<u8>,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Signs certificates for users and agents.
pub trait CertificateAuthority: Send + Sync {
    /// Generate a key pair and a certificate signed by this authority.
    fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, CertError>;

    /// PEM encoding of the authority's own certificate.
    fn ca_cert_pem(&self) -> &str;
}

/// PEM-encoded CA material.
pub struct CaBundle {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
}

/// Generate a self-signed CA suitable for signing worker certificates.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        ca_key_pem: key_pair.serialize_pem(),
    })
}

/// A CA whose certificate and key are available on this host.
pub struct LocalAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
}

impl LocalAuthority {
    /// Build an authority from PEM material. The key may be PKCS#1, SEC1 or
    /// PKCS#8; it is normalised to PKCS#8 before use.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, CertError> {
        let pkey = openssl::pkey::PKey::private_key_from_pem(ca_key_pem.as_bytes())
            .map_err(|e| CertError::Load(format!("CA key: {e}")))?;
        let pkcs8 = pkey
            .private_key_to_pem_pkcs8()
            .map_err(|e| CertError::Load(format!("CA key: {e}")))?;
        let pkcs8 =
            String::from_utf8(pkcs8).map_err(|e| CertError::Load(format!("CA key: {e}")))?;
        let key_pair =
            KeyPair::from_pem(&pkcs8).map_err(|e| CertError::Load(format!("CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
            .map_err(|e| CertError::Load(format!("CA certificate: {e}")))?;

        Ok(Self {
            issuer,
            ca_cert_pem: ca_cert_pem.to_string(),
        })
    }

    /// Read the CA certificate and key from disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CertError> {
        let cert = std::fs::read_to_string(cert_path)
            .map_err(|e| CertError::Load(format!("{}: {e}", cert_path.display())))?;
        let key = std::fs::read_to_string(key_path)
            .map_err(|e| CertError::Load(format!("{}: {e}", key_path.display())))?;
        Self::from_pem(&cert, &key)
    }
}

impl CertificateAuthority for LocalAuthority {
    fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, CertError> {
        let issued_at = Utc::now();
        let not_after = request.validity.expires_at(issued_at)?;

        let mut params = CertificateParams::default();
        apply_subject(&mut params, &request.subject);
        for name in &request.dns_names {
            let dns = Ia5String::try_from(name.as_str())
                .map_err(|e| CertError::Generation(format!("DNS name {name}: {e}")))?;
            params.subject_alt_names.push(SanType::DnsName(dns));
        }
        params.key_usages.push(KeyUsagePurpose::DigitalSignature);
        params.extended_key_usages.push(match request.usage {
            UsageProfile::Client => ExtendedKeyUsagePurpose::ClientAuth,
            UsageProfile::Server => ExtendedKeyUsagePurpose::ServerAuth,
        });
        let serial = random_serial();
        params.serial_number = Some(SerialNumber::from(serial));
        params.not_before = to_offset(issued_at - TimeDelta::minutes(NOT_BEFORE_SKEW_MINUTES))?;
        params.not_after = to_offset(not_after)?;
        params.use_authority_key_identifier_extension = true;
        if !request.ocsp_responders.is_empty() {
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(
                    AUTHORITY_INFO_ACCESS_OID,
                    authority_info_access(&request.ocsp_responders),
                ));
        }

        let key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.issuer)
            .map_err(|e| CertError::Generation(e.to_string()))?;

        Ok(IssuedCertificate {
            serial: serial.to_string(),
            cert_der: cert.der().to_vec(),
            cert_pem: cert.pem(),
            key_der: key.serialize_der(),
            key_pem: key.serialize_pem(),
            not_after,
        })
    }

    fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

fn apply_subject(params: &mut CertificateParams, subject: &SubjectTemplate) {
    let dn = &mut params.distinguished_name;
    dn.push(DnType::CommonName, subject.common_name.as_str());
    let optional = [
        (DnType::OrganizationName, &subject.organization),
        (DnType::CountryName, &subject.country),
        (DnType::StateOrProvinceName, &subject.province),
        (DnType::LocalityName, &subject.locality),
        (DnType::CustomDnType(vec![2, 5, 4, 9]), &subject.street_address),
        (DnType::CustomDnType(vec![2, 5, 4, 17]), &subject.postal_code),
    ];
    for (ty, value) in optional {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            dn.push(ty, value);
        }
    }
}

/// Positive 63-bit serial; the top bit stays clear so DER never needs a
/// leading zero byte to keep the INTEGER positive.
fn random_serial() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX >> 1)
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime, CertError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CertError::Generation(format!("validity: {e}")))
}

/// DER `AuthorityInfoAccessSyntax` listing each URL as an OCSP responder.
fn authority_info_access(urls: &[String]) -> Vec<u8> {
    let mut descriptions = Vec::new();
    for url in urls {
        let mut description = OCSP_ACCESS_METHOD.to_vec();
        // [6] IMPLICIT IA5String: uniformResourceIdentifier
        description.extend(der_tlv(0x86, url.as_bytes()));
        descriptions.extend(der_tlv(0x30, &description));
    }
    der_tlv(0x30, &descriptions)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        #[allow(clippy::cast_possible_truncation)]
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
    out.extend_from_slice(content);
    out
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::needless_pass_by_value
)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn authority() -> LocalAuthority {
        let ca = generate_ca("Fleet Test").unwrap();
        LocalAuthority::from_pem(&ca.ca_cert_pem, &ca.ca_key_pem).unwrap()
    }

    fn agent_request(dns: &str) -> CertificateRequest {
        CertificateRequest {
            subject: SubjectTemplate {
                common_name: "Fleet Agent Services".into(),
                organization: Some("Fleet".into()),
                country: Some("ES".into()),
                ..SubjectTemplate::default()
            },
            dns_names: vec![dns.into()],
            usage: UsageProfile::Server,
            validity: Validity {
                years: 1,
                months: 0,
                days: 0,
            },
            ocsp_responders: vec!["http://ocsp.fleet.test:8000".into()],
        }
    }

    #[test]
    fn issued_certificate_is_signed_by_the_ca() {
        let ca = authority();
        let issued = ca.issue(&agent_request("agent-7.fleet.test")).unwrap();

        let cert = openssl::x509::X509::from_der(&issued.cert_der).unwrap();
        let ca_cert = openssl::x509::X509::from_pem(ca.ca_cert_pem().as_bytes()).unwrap();
        let ca_key = ca_cert.public_key().unwrap();
        assert!(cert.verify(&ca_key).unwrap());
        assert!(issued.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn serial_in_record_matches_certificate() {
        let issued = authority().issue(&agent_request("a.fleet.test")).unwrap();
        let cert = openssl::x509::X509::from_der(&issued.cert_der).unwrap();
        let bn = cert.serial_number().to_bn().unwrap();
        assert_eq!(bn.to_dec_str().unwrap().to_string(), issued.serial);
    }

    #[test]
    fn every_issuance_gets_a_fresh_serial() {
        let ca = authority();
        let a = ca.issue(&agent_request("a.fleet.test")).unwrap();
        let b = ca.issue(&agent_request("a.fleet.test")).unwrap();
        assert_ne!(a.serial, b.serial);
        assert_ne!(a.key_der, b.key_der);
    }

    #[test]
    fn loading_rejects_garbage_key() {
        let ca = generate_ca("Fleet Test").unwrap();
        let result = LocalAuthority::from_pem(&ca.ca_cert_pem, "not a key");
        assert!(matches!(result, Err(CertError::Load(_))));
    }

    #[test]
    fn validity_adds_calendar_units() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 12, 0, 0).unwrap();
        let validity = Validity {
            years: 1,
            months: 1,
            days: 2,
        };
        let end = validity.expires_at(start).unwrap();
        // Jan 31 + 13 months clamps to Feb 28 2025, then two days.
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap());
    }

    #[test]
    fn aia_extension_encodes_each_responder() {
        let der = authority_info_access(&["http://a".into(), "http://b".into()]);
        assert_eq!(der[0], 0x30);
        assert_eq!(usize::from(der[1]), der.len() - 2);
        let a = der.windows(8).any(|w| w == b"http://a");
        let b = der.windows(8).any(|w| w == b"http://b");
        assert!(a && b);
    }

    #[test]
    fn long_lengths_use_multi_byte_form() {
        let content = vec![0u8; 300];
        let tlv = der_tlv(0x04, &content);
        assert_eq!(&tlv[..4], &[0x04, 0x82, 0x01, 0x2C]);
        assert_eq!(tlv.len(), 304);
    }
}
