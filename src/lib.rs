pub mod activity;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod errors;
pub mod homedirs;
pub mod mount;
pub mod platform;
pub mod policy;
pub mod service;
pub mod session;
pub mod vault;
pub mod worker;
