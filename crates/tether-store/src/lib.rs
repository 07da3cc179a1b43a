pub mod error;
pub mod session;
pub mod store;

pub use error::StoreError;
pub use session::{PersistedSession, SessionState};
pub use store::{SessionStore, StoreConfig};
