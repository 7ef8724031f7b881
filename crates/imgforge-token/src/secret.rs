/// Process-wide HMAC signing secret, set once during startup and treated as
/// immutable thereafter. A dedicated wrapper type (rather than a bare
/// `Vec<u8>`) keeps this secret from being accidentally interchanged with
/// any other byte buffer floating around the process.
#[derive(Clone)]
pub struct HmacSecret(Vec<u8>);

impl HmacSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for HmacSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HmacSecret").field(&"<redacted>").finish()
    }
}
