/// External API clients and the trait seams the services consume
///
/// The poller, reconciliation engine and oracle all talk to providers
/// through these traits so tests can substitute deterministic mocks.
pub mod chain;
pub mod market;

pub use chain::{ChainApi, HttpChainApi, ParsedTransfer};
pub use market::{HttpMarketDataApi, MarketData, MarketDataApi};

/// Wrapped-SOL mint, used to value native-asset proceeds
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";
