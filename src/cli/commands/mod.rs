pub mod claims;
pub mod config;
pub mod tenant;
pub mod token;
