pub(crate) mod audit;
pub(crate) mod break_lock;
pub(crate) mod find;
pub(crate) mod mirror;
pub(crate) mod pin;
pub(crate) mod prune;
pub(crate) mod repack;
pub(crate) mod reset;
pub(crate) mod restore;
pub(crate) mod show;
