pub mod auth;
pub mod context;
pub mod response;

pub use auth::jwt_auth_middleware;
pub use context::ClientContext;
pub use response::{ApiResponse, ApiResult};
