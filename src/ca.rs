// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Private certificate authority and per-host leaf minting for interception.

use crate::error::{Error, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tracing::{info, warn};

pub const CA_CERT_FILE: &str = "roo-sniffer-ca.pem";
pub const CA_KEY_FILE: &str = "roo-sniffer-ca-key.pem";

const CA_COMMON_NAME: &str = "Roo Sniffer CA";
const CA_ORGANIZATION: &str = "Roo Sniffer";
const CA_COUNTRY: &str = "US";
const RSA_BITS: usize = 2048;
const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// A minted server certificate: leaf + root chain and its private key,
/// ready for a rustls server config.
pub struct LeafCert {
    pub chain: Vec<rustls::Certificate>,
    pub key: rustls::PrivateKey,
}

/// Owns the root key-pair and certificate, and a cache of per-host leaves.
///
/// Leaves are generated lazily on the first interception of a host and kept
/// for the process lifetime; they are never written to disk. Only the root
/// material is persisted, so a restart with the same `cert_dir` presents the
/// same trust anchor to clients.
pub struct CertificateAuthority {
    /// The root certificate object used for signing leaves.
    signer: Certificate,
    ca_cert_pem: String,
    ca_cert_der: rustls::Certificate,
    cert_path: PathBuf,
    /// Leaf serials count up from the wall-clock second of startup.
    serial: AtomicU64,
    cache: RwLock<HashMap<String, Arc<LeafCert>>>,
}

impl CertificateAuthority {
    /// Load the CA from `cert_dir`, or generate and persist a fresh one when
    /// the files are missing or unreadable. Fails only when generation or
    /// persistence itself fails.
    pub async fn load_or_init(cert_dir: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(cert_dir).await.map_err(|e| {
            Error::Config(format!("cert dir {} is unusable: {e}", cert_dir.display()))
        })?;

        let cert_path = cert_dir.join(CA_CERT_FILE);
        let key_path = cert_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            match Self::load(&cert_path, &key_path).await {
                Ok(ca) => {
                    info!(path = %cert_path.display(), "loaded existing CA");
                    return Ok(ca);
                }
                Err(e) => warn!(%e, "failed to load CA material, regenerating"),
            }
        }

        info!(path = %cert_path.display(), "generating new CA");
        Self::generate_and_save(&cert_path, &key_path).await
    }

    async fn load(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let cert_pem = fs::read_to_string(cert_path)
            .await
            .map_err(|e| Error::Crypto(format!("failed to read CA cert: {e}")))?;
        let key_pem = fs::read_to_string(key_path)
            .await
            .map_err(|e| Error::Crypto(format!("failed to read CA key: {e}")))?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::Crypto(format!("failed to parse CA key pair: {e}")))?;

        // Rebuild the signer from the persisted key. The distinguished name
        // is fixed, so reissuing it here keeps leaf issuers identical to the
        // subject of the certificate on disk.
        let mut params = ca_params();
        params.key_pair = Some(key_pair);
        let signer = Certificate::from_params(params)
            .map_err(|e| Error::Crypto(format!("failed to rebuild CA signer: {e}")))?;

        let ca_cert_der = first_certificate_der(&cert_pem)?;

        Ok(Arc::new(Self {
            signer,
            ca_cert_pem: cert_pem,
            ca_cert_der,
            cert_path: cert_path.to_path_buf(),
            serial: AtomicU64::new(wall_clock_seconds()),
            cache: RwLock::new(HashMap::new()),
        }))
    }

    async fn generate_and_save(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        // 2048-bit RSA generation takes real CPU time; keep it off the runtime.
        let signer = tokio::task::spawn_blocking(|| -> Result<Certificate> {
            let key_pem = generate_rsa_key_pem()?;
            let key_pair = KeyPair::from_pem(&key_pem)
                .map_err(|e| Error::Crypto(format!("failed to parse generated key: {e}")))?;
            let mut params = ca_params();
            params.key_pair = Some(key_pair);
            Certificate::from_params(params)
                .map_err(|e| Error::Crypto(format!("failed to generate CA: {e}")))
        })
        .await
        .map_err(|e| Error::Crypto(format!("CA generation task failed: {e}")))??;

        let cert_pem = signer
            .serialize_pem()
            .map_err(|e| Error::Crypto(format!("failed to serialize CA cert: {e}")))?;
        let key_pem = signer.serialize_private_key_pem();

        write_private_file(cert_path, &cert_pem).await?;
        write_private_file(key_path, &key_pem).await?;

        let ca_cert_der = first_certificate_der(&cert_pem)?;

        Ok(Arc::new(Self {
            signer,
            ca_cert_pem: cert_pem,
            ca_cert_der,
            cert_path: cert_path.to_path_buf(),
            serial: AtomicU64::new(wall_clock_seconds()),
            cache: RwLock::new(HashMap::new()),
        }))
    }

    /// Return the cached leaf for `hostname`, minting one when absent.
    ///
    /// Safe to call concurrently. Two first-callers for the same host may
    /// both mint; the leaves are interchangeable and the last insert wins.
    pub async fn leaf_for(&self, hostname: &str) -> Result<Arc<LeafCert>> {
        let hostname = hostname.to_ascii_lowercase();

        {
            let cache = self.cache.read().unwrap();
            if let Some(leaf) = cache.get(&hostname) {
                return Ok(leaf.clone());
            }
        }

        // Key generation is the expensive part; keep it off the runtime so
        // other connections progress during a first-time mint.
        let key_pem = tokio::task::spawn_blocking(generate_rsa_key_pem)
            .await
            .map_err(|e| Error::Crypto(format!("leaf key generation task failed: {e}")))??;
        let leaf = Arc::new(self.mint_leaf(&hostname, &key_pem)?);

        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(hostname, leaf.clone());
        }

        Ok(leaf)
    }

    fn mint_leaf(&self, hostname: &str, key_pem: &str) -> Result<LeafCert> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::Crypto(format!("failed to parse leaf key: {e}")))?;

        let mut params = CertificateParams::default();
        params.alg = &PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = false;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.subject_alt_names = vec![match hostname.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(hostname.to_string()),
        }];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(5);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);
        params.serial_number = Some(self.serial.fetch_add(1, Ordering::Relaxed).into());

        let cert = Certificate::from_params(params)
            .map_err(|e| Error::Crypto(format!("failed to build leaf for {hostname}: {e}")))?;
        let leaf_der = cert
            .serialize_der_with_signer(&self.signer)
            .map_err(|e| Error::Crypto(format!("failed to sign leaf for {hostname}: {e}")))?;
        let key_der = cert.serialize_private_key_der();

        Ok(LeafCert {
            chain: vec![rustls::Certificate(leaf_der), self.ca_cert_der.clone()],
            key: rustls::PrivateKey(key_der),
        })
    }

    /// On-disk location of the root certificate, for installing as a trust
    /// root.
    pub fn ca_cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_RSA_SHA256;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params
        .distinguished_name
        .push(DnType::OrganizationName, CA_ORGANIZATION);
    params
        .distinguished_name
        .push(DnType::CountryName, CA_COUNTRY);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params.serial_number = Some(wall_clock_seconds().into());
    params
}

/// rcgen signs with existing RSA keys but cannot generate them, so the
/// key material comes from the rsa crate as PKCS#8 PEM.
fn generate_rsa_key_pem() -> Result<String> {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|e| Error::Crypto(format!("RSA key generation failed: {e}")))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Crypto(format!("RSA key encoding failed: {e}")))?;
    Ok(pem.as_str().to_owned())
}

fn first_certificate_der(pem: &str) -> Result<rustls::Certificate> {
    let ders = rustls_pemfile::certs(&mut pem.as_bytes())
        .map_err(|e| Error::Crypto(format!("failed to parse CA cert PEM: {e}")))?;
    ders.into_iter()
        .next()
        .map(rustls::Certificate)
        .ok_or_else(|| Error::Crypto("no certificate found in CA PEM".into()))
}

async fn write_private_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .await
        .map_err(|e| Error::Crypto(format!("failed to write {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
    }
    Ok(())
}

fn wall_clock_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_cert_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sniffer_ca_test_{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn generate_persists_both_files() {
        let dir = temp_cert_dir();
        let ca = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");

        assert!(dir.join(CA_CERT_FILE).exists());
        assert!(dir.join(CA_KEY_FILE).exists());
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert_eq!(ca.ca_cert_path(), dir.join(CA_CERT_FILE));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn restart_reuses_identical_pem() {
        let dir = temp_cert_dir();

        let ca1 = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");
        let on_disk_before = tokio::fs::read(dir.join(CA_CERT_FILE)).await.unwrap();

        let ca2 = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("load CA");
        let on_disk_after = tokio::fs::read(dir.join(CA_CERT_FILE)).await.unwrap();

        assert_eq!(on_disk_before, on_disk_after);
        assert_eq!(ca1.ca_cert_pem(), ca2.ca_cert_pem());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn corrupt_key_triggers_regeneration() {
        let dir = temp_cert_dir();

        let _ = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");
        tokio::fs::write(dir.join(CA_KEY_FILE), "not a key")
            .await
            .unwrap();

        let ca = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("regenerate CA");
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn leaf_has_chain_and_hostname_identity() {
        let dir = temp_cert_dir();
        let ca = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");

        let leaf = ca.leaf_for("api.example.test").await.expect("mint leaf");
        assert_eq!(leaf.chain.len(), 2);
        assert!(!leaf.key.0.is_empty());

        // Subject CN and DNS SAN both carry the hostname, so the DER must
        // contain its ASCII bytes.
        let der = &leaf.chain[0].0;
        let needle = b"api.example.test";
        assert!(der.windows(needle.len()).any(|w| w == needle));
        // Signed by our root, not self-signed.
        assert_eq!(leaf.chain[1].0, ca.ca_cert_der.0);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn leaf_cache_returns_same_instance() {
        let dir = temp_cert_dir();
        let ca = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");

        let leaf1 = ca.leaf_for("example.test").await.expect("mint leaf");
        let leaf2 = ca.leaf_for("EXAMPLE.TEST").await.expect("cached leaf");
        assert!(Arc::ptr_eq(&leaf1, &leaf2));

        let leaf3 = ca.leaf_for("other.test").await.expect("second leaf");
        assert!(!Arc::ptr_eq(&leaf1, &leaf3));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn concurrent_first_mint_is_safe() {
        let dir = temp_cert_dir();
        let ca = CertificateAuthority::load_or_init(&dir)
            .await
            .expect("generate CA");

        let a = {
            let ca = ca.clone();
            tokio::spawn(async move { ca.leaf_for("racy.test").await })
        };
        let b = {
            let ca = ca.clone();
            tokio::spawn(async move { ca.leaf_for("racy.test").await })
        };

        let leaf_a = a.await.unwrap().expect("mint a");
        let leaf_b = b.await.unwrap().expect("mint b");
        assert_eq!(leaf_a.chain.len(), leaf_b.chain.len());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
