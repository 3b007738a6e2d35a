pub mod account;
pub mod daemon;
pub mod status;
pub mod sync;
