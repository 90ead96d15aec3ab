pub mod selector;
pub mod session;

pub use selector::{NoBackend, SelectCriteria};
pub use session::{RouterSession, SessionContext, SessionError};
