mod de;
mod error;

pub use de::from_str;
pub use error::{Error, Result};
