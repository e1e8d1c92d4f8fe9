// handlers/public/mod.rs - Tier 1: no authentication required

pub mod claim;
pub mod tap;
