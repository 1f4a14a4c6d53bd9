pub mod format;
pub mod status;
pub mod sync;
