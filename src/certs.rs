//! SNI certificate resolution keyed by certificate subject names
//!
//! Every certificate is indexed under its common name and each DNS subject
//! alternative name. A name may belong to at most one certificate. Updates build a
//! new map and swap it in, so handshakes never wait on a writer.

use crate::error::{GatewayError, Result};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::{BTreeSet, HashMap};
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::extensions::GeneralName;

/// A parsed certificate chain with its signing key
pub struct CertificateEntry {
    pub common_name: String,
    pub subject_alt_names: BTreeSet<String>,
    pub certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("common_name", &self.common_name)
            .field("subject_alt_names", &self.subject_alt_names)
            .field("chain_len", &self.certified_key.cert.len())
            .finish()
    }
}

impl CertificateEntry {
    /// Parse a PEM private key and a PEM chain whose first certificate is the leaf
    pub fn from_pem(key_pem: &str, chain_pem: &str) -> Result<Self> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(chain_pem.as_bytes()))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| GatewayError::validation(format!("invalid certificate PEM: {}", e)))?;

        let leaf = chain
            .first()
            .ok_or_else(|| GatewayError::validation("no certificate found in PEM chain"))?;

        let key = load_private_key(key_pem)?;
        let (common_name, subject_alt_names) = subject_names(leaf)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| GatewayError::validation(format!("unsupported private key: {}", e)))?;

        Ok(Self {
            common_name,
            subject_alt_names,
            certified_key: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// Every name this certificate is indexed under
    pub fn names(&self) -> BTreeSet<String> {
        let mut names = self.subject_alt_names.clone();
        names.insert(self.common_name.clone());
        names
    }
}

fn load_private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
        .map_err(|e| GatewayError::validation(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| GatewayError::validation("no private key found in PEM"))
}

fn subject_names(leaf: &CertificateDer<'_>) -> Result<(String, BTreeSet<String>)> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| GatewayError::validation(format!("invalid X.509 certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if common_name.is_empty() {
        return Err(GatewayError::validation("certificate has an empty common name"));
    }

    let mut subject_alt_names = BTreeSet::new();
    let extension = cert
        .subject_alternative_name()
        .map_err(|e| GatewayError::validation(format!("invalid subject alternative names: {}", e)))?;
    if let Some(extension) = extension {
        for name in &extension.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                let dns = dns.trim().to_ascii_lowercase();
                if dns.is_empty() {
                    return Err(GatewayError::validation(
                        "certificate has an empty subject alternative name",
                    ));
                }
                subject_alt_names.insert(dns);
            }
        }
    }

    Ok((common_name, subject_alt_names))
}

type NameIndex = HashMap<String, Arc<CertificateEntry>>;

/// Remove every name that maps to this exact entry
fn drop_entry(index: &mut NameIndex, entry: &Arc<CertificateEntry>) -> usize {
    let before = index.len();
    index.retain(|_, current| !Arc::ptr_eq(current, entry));
    let removed = before - index.len();
    if removed > 0 {
        debug!(common_name = %entry.common_name, names = removed, "Certificate removed");
    }
    removed
}

fn insert_entry(index: &mut NameIndex, entry: Arc<CertificateEntry>) -> Result<()> {
    let names = entry.names();
    if let Some(taken) = names.iter().find(|n| index.contains_key(*n)) {
        return Err(GatewayError::DuplicateName(taken.clone()));
    }
    for name in &names {
        index.insert(name.clone(), Arc::clone(&entry));
    }
    info!(
        common_name = %entry.common_name,
        names = ?names,
        "Certificate registered"
    );
    Ok(())
}

/// Subject name to certificate map consulted during TLS handshakes
#[derive(Default)]
pub struct CertificateResolver {
    by_name: RwLock<Arc<NameIndex>>,
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver")
            .field("names", &self.by_name.read().len())
            .finish()
    }
}

impl CertificateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and register a certificate, returning it
    pub fn add_pem(&self, key_pem: &str, chain_pem: &str) -> Result<Arc<CertificateEntry>> {
        let entry = Arc::new(CertificateEntry::from_pem(key_pem, chain_pem)?);
        self.add_certificate(Arc::clone(&entry))?;
        Ok(entry)
    }

    /// Register an already parsed certificate under all of its names
    pub fn add_certificate(&self, entry: Arc<CertificateEntry>) -> Result<()> {
        self.replace(None, Some(entry))
    }

    /// Remove the certificate indexed under `name` along with all its other names
    pub fn remove_certificate(&self, name: &str) -> Result<()> {
        self.replace(Some(name), None)
    }

    /// Remove one certificate and add another in a single swap.
    ///
    /// Nothing changes unless both halves succeed.
    pub fn replace(&self, remove: Option<&str>, add: Option<Arc<CertificateEntry>>) -> Result<()> {
        let mut guard = self.by_name.write();
        let mut next: NameIndex = guard.as_ref().clone();

        if let Some(name) = remove {
            let name = name.to_ascii_lowercase();
            let existing = next
                .get(&name)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("certificate '{}'", name)))?;
            drop_entry(&mut next, &existing);
        }
        if let Some(entry) = add {
            insert_entry(&mut next, entry)?;
        }

        *guard = Arc::new(next);
        Ok(())
    }

    /// Like [`replace`](Self::replace), but the old certificate is identified by
    /// identity. Names it no longer holds, because it was removed or another
    /// certificate took them over, are left alone.
    pub fn replace_entry(
        &self,
        old: Option<&Arc<CertificateEntry>>,
        add: Option<Arc<CertificateEntry>>,
    ) -> Result<()> {
        let mut guard = self.by_name.write();
        let mut next: NameIndex = guard.as_ref().clone();

        if let Some(old) = old {
            drop_entry(&mut next, old);
        }
        if let Some(entry) = add {
            insert_entry(&mut next, entry)?;
        }

        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove the names still held by `entry`, returning how many were removed
    pub fn release(&self, entry: &Arc<CertificateEntry>) -> usize {
        let mut guard = self.by_name.write();
        let mut next: NameIndex = guard.as_ref().clone();
        let removed = drop_entry(&mut next, entry);
        if removed > 0 {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Exact lookup by server name
    pub fn resolve(&self, server_name: &str) -> Option<Arc<CertificateEntry>> {
        let snapshot = Arc::clone(&self.by_name.read());
        snapshot.get(&server_name.to_ascii_lowercase()).cloned()
    }

    /// All registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let snapshot = Arc::clone(&self.by_name.read());
        let mut names: Vec<String> = snapshot.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.read().is_empty()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        let found = CertificateResolver::resolve(self, server_name);
        if found.is_none() {
            debug!(server_name, "No certificate for SNI name");
        }
        found.map(|entry| Arc::clone(&entry.certified_key))
    }
}
