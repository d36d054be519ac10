pub mod config;
pub mod error;
pub mod http_client;
pub mod normalizer;
pub mod reassembler;
pub mod relay;
pub mod retry;
pub mod session;
pub mod stream;
pub mod telemetry;
#[cfg(test)]
mod test_util;

pub use relay::Relay;
pub use session::{StreamSession, UpstreamRequest};
pub use stream::{OutgoingEvent, RelayStream, into_sse_body, sse_response_headers};
