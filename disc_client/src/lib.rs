pub use error::{ClientError, Result};
pub use limiter::{Limiter, Permit};
pub use rest::{Direction, Rest, DISCORD_API_URL, USER_AGENT};
pub use types::{Attachment, Message, Node};

mod error;
pub mod limiter;
pub mod rest;
pub mod signed_url;
mod types;
