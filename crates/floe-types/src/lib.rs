pub mod bag_id;
pub mod error;
pub mod run_id;

pub use bag_id::BagId;
pub use error::{FloeError, Result};
pub use run_id::RunId;
