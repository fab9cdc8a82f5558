//! Transport encodings for issued certificates.
//!
//! Users receive a password-protected PKCS#12 bundle plus the CA
//! certificate packed in a zip archive; both travel as e-mail attachments.

use std::io::{Cursor, Write};

use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::{CertError, IssuedCertificate};

/// File name of the CA certificate inside the zip archive.
pub const CA_CERT_FILE_NAME: &str = "ca.cer";

/// Wrap an issued certificate, its key and the CA chain into a PKCS#12
/// archive protected by `password`.
pub fn pkcs12_bundle(
    issued: &IssuedCertificate,
    ca_cert_pem: &str,
    friendly_name: &str,
    password: &str,
) -> Result<Vec<u8>, CertError> {
    let bundle_err = |e: openssl::error::ErrorStack| CertError::Bundle(e.to_string());

    let pkey = PKey::private_key_from_pkcs8(&issued.key_der).map_err(bundle_err)?;
    let cert = X509::from_der(&issued.cert_der).map_err(bundle_err)?;
    let ca = X509::from_pem(ca_cert_pem.as_bytes()).map_err(bundle_err)?;

    let mut chain = Stack::new().map_err(bundle_err)?;
    chain.push(ca).map_err(bundle_err)?;

    let pkcs12 = Pkcs12::builder()
        .name(friendly_name)
        .pkey(&pkey)
        .cert(&cert)
        .ca(chain)
        .build2(password)
        .map_err(bundle_err)?;

    pkcs12.to_der().map_err(bundle_err)
}

/// Pack the CA certificate into a single-entry zip archive.
pub fn zip_ca_certificate(ca_cert_pem: &str) -> Result<Vec<u8>, CertError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    writer
        .start_file(CA_CERT_FILE_NAME, options)
        .map_err(|e| CertError::Bundle(e.to_string()))?;
    writer
        .write_all(ca_cert_pem.as_bytes())
        .map_err(|e| CertError::Bundle(e.to_string()))?;
    let cursor = writer
        .finish()
        .map_err(|e| CertError::Bundle(e.to_string()))?;

    Ok(cursor.into_inner())
}
