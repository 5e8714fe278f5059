use nostr::PublicKey;

pub const DEFAULT_ALIAS: &str = "nwc-bridge";
pub const DEFAULT_COLOR: &str = "000000";
pub const DEFAULT_NETWORK: &str = "mainnet";
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// The networks NIP-47 `get_info` can report.
pub const NETWORKS: [&str; 4] = ["mainnet", "testnet", "signet", "regtest"];

/// Static configuration of the wallet service. Immutable once the gateway
/// is built.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// The backend wallet which pays and receives.
    pub wallet_id: String,
    /// Reported by `get_info`.
    pub alias: String,
    /// Reported by `get_info`, hex RGB without `#`.
    pub color: String,
    /// Reported by `get_info`; one of [`NETWORKS`].
    pub network: String,
    /// Requests handled concurrently before we stop pulling new events.
    pub max_in_flight: usize,
    /// Client apps allowed to use this wallet service. If empty, any sender
    /// who can encrypt to the service key is served.
    pub authorized_clients: Vec<PublicKey>,
}

impl GatewayConfig {
    pub fn new(wallet_id: String) -> Self {
        Self {
            wallet_id,
            alias: DEFAULT_ALIAS.to_owned(),
            color: DEFAULT_COLOR.to_owned(),
            network: DEFAULT_NETWORK.to_owned(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            authorized_clients: Vec::new(),
        }
    }

    pub fn is_authorized(&self, sender: &PublicKey) -> bool {
        self.authorized_clients.is_empty()
            || self.authorized_clients.contains(sender)
    }
}
