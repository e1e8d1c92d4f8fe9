// handlers/protected/mod.rs - Tier 2: JWT authentication required
//
// Every handler here receives the caller as `Extension<Actor>`, injected by
// `middleware::jwt_auth_middleware`. Tenant roles are checked by the engine.

pub mod cards;
pub mod claim;
pub mod tenant;
