pub mod decode;
pub mod encode;
pub mod pump;
pub mod sse;
pub mod state;

pub use encode::ClientDialect;
pub use pump::{sse_response, sse_response_from_json, PumpConfig};
