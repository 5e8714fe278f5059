use std::fmt;

use nostr::{PublicKey, SecretKey};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

pub const URI_SCHEME: &str = "nostr+walletconnect";

/// Characters we percent-encode in the relay url: everything but the
/// unreserved characters of RFC 3986.
const PERCENT_ENCODE_ASCII_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The string an operator hands to a client app to pair it with this wallet
/// service:
///
/// `nostr+walletconnect://{service pk}?relay={relay url}&secret={client sk}`
pub struct ConnectionString<'a> {
    pub service_pk: PublicKey,
    pub relay_url: &'a str,
    pub client_secret: &'a SecretKey,
}

impl fmt::Display for ConnectionString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let service_pk_hex = self.service_pk.to_hex();
        let relay =
            utf8_percent_encode(self.relay_url, &PERCENT_ENCODE_ASCII_SET);
        let secret_hex = self.client_secret.to_secret_hex();
        write!(
            f,
            "{URI_SCHEME}://{service_pk_hex}?relay={relay}&secret={secret_hex}"
        )
    }
}
