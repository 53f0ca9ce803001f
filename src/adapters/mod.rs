// src/adapters/mod.rs
pub mod fixture;

pub use fixture::{load_fixtures, FixtureAdapter};
