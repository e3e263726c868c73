//! Provider subsystem for model inference backends.
//!
//! Each backend implements the [`Provider`] trait defined in [`traits`] and is
//! registered in [`create_provider`] by its canonical string key.

pub mod gemini;
pub mod traits;

pub use traits::{ChatMessage, Provider};

/// Factory: create the right provider from config.
pub fn create_provider(name: &str, api_key: Option<&str>) -> anyhow::Result<Box<dyn Provider>> {
    match name {
        "gemini" | "google" => Ok(Box::new(gemini::GeminiProvider::new(api_key))),
        other => anyhow::bail!("Unknown provider: {other}"),
    }
}
