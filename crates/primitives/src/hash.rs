use blockd_consensus::Hash256;
use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> Hash256 {
    Sha256::digest(data).into()
}

pub fn sha256d(data: &[u8]) -> Hash256 {
    Sha256::digest(Sha256::digest(data)).into()
}

/// Incremental double-SHA256 over several slices.
#[derive(Clone, Default)]
pub struct Sha256dWriter {
    inner: Sha256,
}

impl Sha256dWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    pub fn finalize(self) -> Hash256 {
        Sha256::digest(self.inner.finalize()).into()
    }
}
