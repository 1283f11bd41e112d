//! Hot-swappable serving certificate

use crate::error::CertResult;
use crate::material::CertificateMaterial;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
struct Installed {
    key: Arc<CertifiedKey>,
    material: Arc<CertificateMaterial>,
}

/// Certificate resolver whose material can be replaced while the listener
/// runs. Established sessions keep what they negotiated; new handshakes see
/// the replacement. Readers get either the old pair or the new one.
#[derive(Default)]
pub struct HotSwapResolver {
    installed: RwLock<Option<Installed>>,
}

impl std::fmt::Debug for HotSwapResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotSwapResolver")
            .field("version", &self.current().map(|m| m.source_version))
            .finish()
    }
}

impl HotSwapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the served material
    pub fn install(&self, material: Arc<CertificateMaterial>) -> CertResult<()> {
        let key = material.certified_key()?;
        let installed = Installed { key, material };
        match self.installed.write() {
            Ok(mut slot) => *slot = Some(installed),
            Err(poisoned) => *poisoned.into_inner() = Some(installed),
        }
        Ok(())
    }

    pub fn current(&self) -> Option<Arc<CertificateMaterial>> {
        self.read().map(|i| i.material)
    }

    fn read(&self) -> Option<Installed> {
        match self.installed.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ResolvesServerCert for HotSwapResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.read().map(|i| i.key)
    }
}
