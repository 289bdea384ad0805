pub mod error;
pub mod session;
pub mod splice;
pub mod terminal;

pub use error::RelayError;
pub use session::{start, RelayConfig};
pub use terminal::TerminalError;
