//! Certificate issuance for the fleet workers.
//!
//! - [`authority`]: key generation and signing with a local CA (`rcgen`)
//! - [`bundle`]: PKCS#12 and zip encodings used to ship certificates

pub mod authority;
pub mod bundle;

pub use authority::{
    CaBundle, CertificateAuthority, CertificateRequest, IssuedCertificate, LocalAuthority,
    SubjectTemplate, UsageProfile, Validity, generate_ca,
};
pub use bundle::{pkcs12_bundle, zip_ca_certificate};

/// Certificate errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// Key generation or signing failed.
    #[error("Certificate generation error: {0}")]
    Generation(String),

    /// CA material could not be read or parsed.
    #[error("Certificate load error: {0}")]
    Load(String),

    /// Transport encoding failed.
    #[error("Certificate bundle error: {0}")]
    Bundle(String),
}
