//! TLS key material helpers.
//!
//! When no certificate/key pair is configured, a single-day self-signed
//! ECDSA P-256 pair is generated into temp files. The files live for as long
//! as the subsystem holds the [`SelfSignedMaterial`] and are removed on drop.

use crate::prelude::*;
use rustls::{Certificate, PrivateKey, ServerConfig};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Error, Debug)]
pub enum PemError {
    #[error("unable to create temporary file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to generate self-signed certificate: {0}")]
    Generate(String),

    #[error("no private key found in {0}")]
    MissingKey(String),

    #[error("no certificate found in {0}")]
    MissingCertificate(String),

    #[error("unusable TLS material: {0}")]
    Tls(#[from] rustls::Error),
}

pub struct SelfSignedMaterial {
    pub certificate: NamedTempFile,
    pub key: NamedTempFile,
}

impl SelfSignedMaterial {
    pub fn certificate_path(&self) -> &Path {
        self.certificate.path()
    }

    pub fn key_path(&self) -> &Path {
        self.key.path()
    }
}

/// Generate a one-day self-signed ECDSA P-256 certificate and key pair in
/// temp files.
pub fn generate_self_signed() -> Result<SelfSignedMaterial, PemError> {
    let mut params = rcgen::CertificateParams::default();

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "LEXA DEFAULT CERTIFICATE");
    dn.push(rcgen::DnType::OrganizationName, "Kaidyth");
    dn.push(rcgen::DnType::OrganizationalUnitName, "Lexa");
    params.distinguished_name = dn;

    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(1);

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|err| PemError::Generate(err.to_string()))?;
    let cert_pem = cert
        .serialize_pem()
        .map_err(|err| PemError::Generate(err.to_string()))?;
    let key_pem = cert.serialize_private_key_pem();

    let mut certificate = tempfile::Builder::new()
        .prefix("server")
        .suffix(".crt")
        .tempfile()?;
    certificate.write_all(cert_pem.as_bytes())?;

    let mut key = tempfile::Builder::new()
        .prefix("server")
        .suffix(".key")
        .tempfile()?;
    key.write_all(key_pem.as_bytes())?;

    Ok(SelfSignedMaterial { certificate, key })
}

/// Build a TLS 1.2+ server configuration from PEM files on disk.
pub fn tls_server_config(certificate: &Path, key: &Path) -> Result<ServerConfig, PemError> {
    let certs = read_certificates(certificate)?;
    let key = read_private_key(key)?;

    Ok(ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

fn read_certificates(path: &Path) -> Result<Vec<Certificate>, PemError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(PemError::MissingCertificate(path.display().to_string()));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKey, PemError> {
    let mut reader = BufReader::new(File::open(path)?);
    while let Some(item) = rustls_pemfile::read_one(&mut reader)? {
        match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::ECKey(key)
            | rustls_pemfile::Item::RSAKey(key) => return Ok(PrivateKey(key)),
            _ => continue,
        }
    }
    Err(PemError::MissingKey(path.display().to_string()))
}
