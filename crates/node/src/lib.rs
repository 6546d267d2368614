//! # EkS Node Services
//!
//! Off-chain, per-node machinery that accompanies the consensus core. The
//! only service in scope here is the [`upgrade`] manager, which takes
//! on-chain upgrade descriptors through their startup and consensus stages
//! across node restarts.

pub mod upgrade;
