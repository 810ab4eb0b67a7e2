#![forbid(unsafe_code)]

pub mod common;
pub mod service;
