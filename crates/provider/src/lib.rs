//! LLM provider implementations for Canopy.
//!
//! Currently a single backend: the Google Gemini Generative Language API,
//! consumed through the `TextGenerator` trait defined in `canopy-core`.

pub mod gemini;

pub use gemini::GeminiClient;
