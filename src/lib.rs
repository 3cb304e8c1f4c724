//! gridbot: automated limit-order trading engines for XTS-style brokers.
//!
//! Exposes the broker client, persistent journals, and the two engine
//! variants (grid market-maker and pair ratio mean-reversion) for use by
//! the binary and the test suite.

pub mod broker;
pub mod config;
pub mod engine;
pub mod journal;

pub use broker::{BrokerApi, NormalizedOrder, OrderRequest, OrderSide, OrderStatus, Quote};
pub use config::{BrokerCredentials, GridConfig, PairsConfig};
pub use engine::{grid::GridEngine, pairs::PairsEngine};
