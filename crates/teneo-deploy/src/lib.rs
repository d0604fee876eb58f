//! Identity deployment pipeline for the Teneo agent SDK.
//!
//! Establishes a wallet-bound agent identity: a multi-step, crash-safe
//! idempotent protocol spanning the HTTP backend (metadata + mint
//! authorization), the identity contract (the mint itself), and two local
//! durable files (deploy-state and the per-agent WAL).
//!
//! Entry points: [`Deployer`] for programmatic deployments and [`Minter`]
//! for the sync-first headless flow driven by a JSON descriptor.

pub mod chain;
pub mod client;
pub mod deployer;
mod fsio;
pub mod hash;
pub mod minter;
pub mod signer;
pub mod state;
pub mod wal;

pub use chain::{ChainApi, ChainConnector, JsonRpcChain, JsonRpcConnector, MintOutcome, TxReceipt};
pub use client::{BackendApi, BackendClient, SyncStatus};
pub use deployer::{deploy_agent, DeployConfig, DeployResult, Deployer};
pub use hash::config_hash;
pub use minter::{MintConfig, MintResult, MintStatus, Minter};
pub use signer::{WalletSigner, SDK_AUTH_MESSAGE_PREFIX};
pub use state::{DeployState, DeployStatus, StateStore};
pub use wal::{WalEntry, WalState, WalStore};
