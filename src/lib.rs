pub mod app;
pub mod auth;
pub mod cli;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

#[cfg(test)]
pub mod testing;
