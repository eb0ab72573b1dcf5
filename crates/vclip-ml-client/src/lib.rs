//! HTTP clients for the two external providers the render core depends on
//! but does not implement itself: text-to-speech synthesis and font
//! provisioning. Both wrap a small `reqwest`-backed client struct behind
//! the trait boundary `vclip-media` defines at its TTS Cache / Export
//! Pipeline seams.

pub mod error;
pub mod font;
pub mod tts;

pub use error::{ClientError, ClientResult};
pub use font::{FontClientConfig, HttpFontClient};
pub use tts::{HttpTtsClient, TtsClientConfig};
