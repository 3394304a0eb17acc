// Authentication module
// Token store, single-flight refresh and session lifecycle
//
// Token writes are only reachable from inside this module: `TokenWriter` is
// owned by `RefreshLockManager`, and `AuthService` goes through it for login
// and logout. `RefreshOperation` is private to the module.

mod manager;
mod refresh;
mod service;
mod session;
mod storage;
mod store;
mod types;

pub use manager::RefreshLockManager;
pub use service::AuthService;
pub use session::SessionContext;
pub use store::TokenManager;
pub use types::{LockStatus, SessionEvent, TokenPair};
