//! leget command-line front end

pub mod config;
