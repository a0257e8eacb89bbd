pub mod config;
pub mod decode;
pub mod dump;
pub mod end_time;
pub mod error;
pub mod histogram;
pub mod loader;
pub mod reader;
pub mod record;
pub mod search;
pub mod serde;
pub mod timeline;
pub mod tokenizer;
pub mod valid_pe;

pub use error::{Error, Result};
