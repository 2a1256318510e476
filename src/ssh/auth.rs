use std::path::Path;

use color_eyre::eyre::Context;
use russh::keys::{
    ssh_key::{AuthorizedKeys, Fingerprint, HashAlg},
    PublicKey,
};

// Public-key authentication policy for the SSH control plane. The key
// material is read once at startup; there is no re-reading on connection.
pub(crate) enum Authenticator {
    // `disable_auth`: any peer may connect.
    AcceptAll,
    // Only peers whose public key appears in the authorized keys file.
    AuthorizedKeys(Vec<PublicKey>),
}

impl Authenticator {
    pub(crate) async fn from_authorized_keys(path: &Path) -> color_eyre::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| "Error reading authorized keys file")?;
        let keys = AuthorizedKeys::new(&contents)
            .map(|entry| {
                entry
                    .map(|entry| entry.public_key().clone())
                    .with_context(|| "Error parsing authorized keys entry")
            })
            .collect::<color_eyre::Result<Vec<_>>>()?;
        Ok(Authenticator::AuthorizedKeys(keys))
    }

    // Returns the peer's identity (its key fingerprint) when the offered
    // key is acceptable.
    pub(crate) fn accept(&self, offered: &PublicKey) -> Option<Fingerprint> {
        match self {
            Authenticator::AcceptAll => Some(offered.fingerprint(HashAlg::Sha256)),
            Authenticator::AuthorizedKeys(keys) => keys
                .iter()
                .any(|key| key.key_data() == offered.key_data())
                .then(|| offered.fingerprint(HashAlg::Sha256)),
        }
    }

    pub(crate) fn accepts_anyone(&self) -> bool {
        matches!(self, Authenticator::AcceptAll)
    }
}
