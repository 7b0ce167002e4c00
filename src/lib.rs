pub mod app;
pub mod auth;
pub mod backend;
pub mod config;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod prompt;
pub mod relay;
pub mod settings;
pub mod tools;
pub mod upstream;
pub mod verifier;
