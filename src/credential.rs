use rand::{rngs::OsRng, RngCore};
use serde::{Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Number of random bytes behind every credential.
const CREDENTIAL_BYTES: usize = 32;

/// Shared secret handed to one worker generation.
///
/// A new value is generated for every spawn and dropped (and wiped) as soon as the
/// worker it belongs to is gone. `Debug` never prints the secret, so the value can
/// travel through structured logs without leaking.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credential(String);

impl Credential {
    /// Draws a fresh secret from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; CREDENTIAL_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        bytes.zeroize();
        Self(secret)
    }

    /// The secret as it is exported to the worker environment.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
