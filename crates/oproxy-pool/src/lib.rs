pub mod channel;
pub mod credential;
pub mod health;
pub mod registry;
pub mod select;
pub mod stats;

pub use channel::{Channel, ChannelRegistry, ChannelsFile, ConcurrencyGuard};
pub use credential::{
    api_url, mask_key, normalize_base_url, parse_key_string, Credential, ParsedKey,
};
pub use health::HealthChecker;
pub use registry::{
    AddOutcome, BatchImportReport, KeyRegistry, KeySummary, KeysFile, MaskedCredential,
};
pub use select::{Selection, Selector};
pub use stats::{DayStat, StatsFile, StatsRegistry};
