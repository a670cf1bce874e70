#![forbid(unsafe_code)]

pub mod commands;
pub mod console;
pub mod context;
pub mod health;
pub mod http;
pub mod hub;
pub mod replay;
pub mod session;
pub mod socket;


#[cfg(test)]
mod session_tests;
