//! bus-engine — name registry, match rules, per-connection buffering
//! and transactions, the driver, and the dispatcher that ties them
//! together (C4/C5). Transport and scheduling live in `busd`; this
//! crate is pure logic so it can be driven by tests without a socket.

pub mod connection;
pub mod dispatch;
pub mod driver;
pub mod match_rule;
pub mod registry;

pub use connection::{Connection, Transaction, TransactionError};
pub use dispatch::{AllowAll, Context, Dispatcher};
pub use match_rule::{MatchRule, MatchRuleError};
pub use registry::{ConnId, NameRegistry};
