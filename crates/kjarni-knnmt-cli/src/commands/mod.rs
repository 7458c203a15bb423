pub mod config;
pub mod info;
pub mod search;

mod util;
