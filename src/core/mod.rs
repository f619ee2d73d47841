//! Chain data model and the logic deciding what enters the chain.
//!
//! - `Transaction`, `Block`, `Header`: immutable, content-addressed values
//! - `Validator`: ordered validation pipeline with pluggable proof and conflict rules
//! - `Ledger`: block tree, fork choice, orphans and pruning
//! - `Blockchain`: ledger plus transaction pool and block production

pub mod block;
pub mod blockchain;
pub mod ledger;
mod orphans;
pub mod transaction;
pub mod validator;
