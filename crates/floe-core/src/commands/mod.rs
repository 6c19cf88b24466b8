pub mod audit;
pub mod find;
pub mod mirror;
pub mod pin;
pub mod prune;
pub mod repack;
pub mod reset;
pub mod restore;
pub mod show;
pub(crate) mod stage;
pub mod util;
