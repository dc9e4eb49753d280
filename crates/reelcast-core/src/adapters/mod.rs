//! Provider implementations.
//!
//! | Adapter | Use |
//! |---------|-----|
//! | [`HttpJsonProvider`] | Remote model endpoint reached through an [`HttpClient`](crate::http_client::HttpClient) |
//! | [`ScriptedProvider`] | Deterministic, call-recording provider for offline runs and tests |

mod http_json;
mod scripted;

pub use http_json::HttpJsonProvider;
pub use scripted::{ScriptedProvider, Step};
