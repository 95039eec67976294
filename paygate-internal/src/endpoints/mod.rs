pub mod account;
pub mod completions;
pub mod fallback;
pub mod status;
