// Position tracking module - ledger, state registry, persistence, PnL
pub mod db;
pub mod ledger;
pub mod pnl;
pub mod state;
pub mod types;

// Public API exports
pub use ledger::{apply_buy, apply_exact_exit, apply_sell, ApplyOutcome, BuyEvent, SellEvent};

pub use state::{
    acquire_position_lock, all_positions, get_position, initialize_positions_system,
    position_count, PositionLockGuard,
};

pub use types::{position_key, Position, PositionStatus, BALANCE_EPSILON};
