use anyhow::Context;
use nostr::{
    Event, EventBuilder, Keys, PublicKey,
    nips::{nip04, nip44},
};

use crate::nip47;

/// The payload encryption scheme a counterparty used. We always answer with
/// the scheme the request arrived with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encryption {
    /// NIP-44 v2. The default.
    Nip44,
    /// Legacy NIP-04, still used by some client apps.
    Nip04,
}

impl Encryption {
    /// NIP-04 payloads are `<base64>?iv=<base64>`; NIP-44 payloads are plain
    /// base64, which never contains `?`.
    pub fn detect(content: &str) -> Self {
        if content.contains("?iv=") {
            Self::Nip04
        } else {
            Self::Nip44
        }
    }

    pub fn notification_kind(&self) -> u16 {
        match self {
            Self::Nip44 => nip47::NOTIFICATION_KIND,
            Self::Nip04 => nip47::NOTIFICATION_KIND_NIP04,
        }
    }

    /// The names advertised in the info event's `encryption` tag.
    pub const ADVERTISED: &'static str = "nip44_v2 nip04";
}

/// Payload encryption and event signing with the wallet service keys.
pub struct Envelope {
    keys: Keys,
}

impl Envelope {
    pub fn new(keys: Keys) -> Self {
        Self { keys }
    }

    #[inline]
    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Decrypt a request payload sent to us by `sender`.
    pub fn decrypt(
        &self,
        sender: &PublicKey,
        content: &str,
    ) -> anyhow::Result<(String, Encryption)> {
        let secret_key = self.keys.secret_key();
        let encryption = Encryption::detect(content);
        let plaintext = match encryption {
            Encryption::Nip44 => nip44::decrypt(secret_key, sender, content)
                .context("Failed to decrypt NIP-44 payload")?,
            Encryption::Nip04 => nip04::decrypt(secret_key, sender, content)
                .context("Failed to decrypt NIP-04 payload")?,
        };
        Ok((plaintext, encryption))
    }

    /// Encrypt a payload for `recipient`.
    pub fn encrypt(
        &self,
        recipient: &PublicKey,
        plaintext: &str,
        encryption: Encryption,
    ) -> anyhow::Result<String> {
        let secret_key = self.keys.secret_key();
        match encryption {
            Encryption::Nip44 => nip44::encrypt(
                secret_key,
                recipient,
                plaintext,
                nip44::Version::default(),
            )
            .context("Failed to encrypt NIP-44 payload"),
            Encryption::Nip04 =>
                nip04::encrypt(secret_key, recipient, plaintext)
                    .context("Failed to encrypt NIP-04 payload"),
        }
    }

    /// Sign an event as the wallet service.
    pub fn sign(&self, builder: EventBuilder) -> anyhow::Result<Event> {
        builder
            .sign_with_keys(&self.keys)
            .context("Failed to sign event")
    }
}
