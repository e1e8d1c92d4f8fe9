// handlers/mod.rs - Two-tier handler layout
//
// Public (no auth): claim links and card taps
// Protected (JWT auth): tenant administration, cards, claim issuance

pub mod protected;
pub mod public;
