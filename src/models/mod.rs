// Domain records shared by the store, the engine and the HTTP layer

pub mod audit;
pub mod card;
pub mod claim_token;
pub mod membership;
pub mod tenant;

pub use audit::*;
pub use card::*;
pub use claim_token::*;
pub use membership::*;
pub use tenant::*;
