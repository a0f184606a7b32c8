pub mod auth;
pub mod origin;

pub use auth::{auth_middleware, AuthUser};
pub use origin::ClientOrigin;
