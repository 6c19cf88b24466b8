pub mod branch;
pub mod commands;
pub mod config;
pub mod container;
pub mod filter;
pub mod inventory;
pub mod keys;
pub mod ledger;
pub mod limits;
pub mod manifest;
pub mod mount;
pub mod packer;
pub mod platform;
pub mod pricing;
pub mod scan;
pub mod transfer;

#[cfg(test)]
mod testutil;
