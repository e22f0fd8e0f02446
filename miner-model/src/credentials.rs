use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication material issued by the backend at login.
///
/// The token and the miner id always travel together; a value of this type
/// cannot exist with only one of them. The token is wiped from memory on drop
/// and never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    token: String,
    miner_id: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>, miner_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            miner_id: miner_id.into(),
        }
    }

    /// Opaque bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn miner_id(&self) -> &str {
        &self.miner_id
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("miner_id", &self.miner_id)
            .finish()
    }
}
