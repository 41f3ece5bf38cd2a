//! Key and certificate generation command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use peerlink::crypto::{Certificate, CertificateProfile, SigningKeyPair};

use super::CommandExecutor;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Generate a signing key and a certificate for it.
///
/// With `--authority` a self-signed root is created. Otherwise the
/// certificate is issued by the authority at `--issuer`.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// Display name of the subject
    #[arg(short, long)]
    pub name: String,

    /// Email address of the subject
    #[arg(short, long)]
    pub email: String,

    /// Output path (creates .cert and .key files)
    #[arg(short, long, default_value = "peerlink")]
    pub output: PathBuf,

    /// Create a self-signed signing authority instead of a user
    #[arg(long, conflicts_with = "issuer")]
    pub authority: bool,

    /// Base path of the issuing authority's .cert and .key files
    #[arg(long, required_unless_present = "authority")]
    pub issuer: Option<PathBuf>,

    /// Validity period in days
    #[arg(long, default_value = "365")]
    pub validity_days: u64,

    /// Where revocation status of the new certificate can be queried
    #[arg(long)]
    pub revocation_url: Option<String>,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let certificate = self.generate()?;
        let (cert_path, key_path) = output_paths(&self.output);
        let fingerprint = certificate
            .fingerprint()
            .context("Failed to fingerprint certificate")?;

        if self.authority {
            println!("Signing authority generated successfully:");
        } else {
            println!("Identity generated successfully:");
        }
        println!();
        println!("  Subject:     {} <{}>", self.name, self.email);
        println!("  Serial:      {}", hex::encode(certificate.serial()));
        println!("  Fingerprint: {}", hex::encode(fingerprint));
        println!("  Certificate: {}", cert_path.display());
        println!("  Private key: {}", key_path.display());
        println!();
        if self.authority {
            println!("Distribute the certificate (.cert) as a trusted root.");
        } else {
            println!("Your peers need the issuing authority's certificate as a trusted root.");
        }
        println!("Keep the private key (.key) secret and secure.");

        Ok(())
    }
}

impl KeygenCommand {
    /// Creates the key pair and certificate and writes both files.
    pub fn generate(&self) -> Result<Certificate> {
        let validity = Duration::from_secs(self.validity_days.saturating_mul(SECONDS_PER_DAY));
        let keys = SigningKeyPair::generate();

        let certificate = match &self.issuer {
            Some(issuer) if !self.authority => {
                let (issuer_cert_path, issuer_key_path) = output_paths(issuer);
                let issuer_cert = Certificate::load(&issuer_cert_path).with_context(|| {
                    format!("Failed to load issuer certificate {}", issuer_cert_path.display())
                })?;
                let issuer_keys = SigningKeyPair::load(&issuer_key_path).with_context(|| {
                    format!("Failed to load issuer key {}", issuer_key_path.display())
                })?;
                Certificate::issue(
                    CertificateProfile::user(&self.name, &self.email),
                    keys.verifying_key(),
                    &issuer_cert,
                    &issuer_keys,
                    validity,
                    self.revocation_url.clone(),
                )
                .context("Failed to issue certificate")?
            }
            _ => Certificate::issue_root(
                CertificateProfile::authority(&self.name, &self.email),
                &keys,
                validity,
            )
            .context("Failed to create root certificate")?,
        };

        let (cert_path, key_path) = output_paths(&self.output);
        certificate
            .save(&cert_path)
            .with_context(|| format!("Failed to write {}", cert_path.display()))?;
        keys.save(&key_path)
            .with_context(|| format!("Failed to write {}", key_path.display()))?;

        Ok(certificate)
    }
}

/// Certificate and key paths for a base path.
pub fn output_paths(base: &Path) -> (PathBuf, PathBuf) {
    (base.with_extension("cert"), base.with_extension("key"))
}
