//! Boundary plumbing for sinsp plugins written in Rust.
//!
//! The host engine drives plugins through a fixed C ABI on its own threads.
//! This crate provides the pieces that ABI needs on the plugin side: a
//! registry keeping plugin memory alive while the host holds handles to it,
//! opaque state containers, the event array marshaller, and the two
//! rendezvous workers (async field extraction and per-session event dispatch).

pub mod abi;
pub mod batch;
pub mod error;
pub mod event;
pub mod extract;
pub mod fields;
pub mod host;
pub mod native;
pub mod registry;
pub mod state;

pub use abi::{PluginType, ReturnCode, MAX_NEXT_BATCH_EVENTS, REQUIRED_API_VERSION};
pub use batch::{collect_batch, BatchDispatchContext, BatchResult, Operation};
pub use error::{BridgeError, Result};
pub use event::{marshal, NativeEventArray, PluginEvent};
pub use extract::{
    AsyncExtractor, AsyncExtractorHandle, AsyncExtractorInfo, BridgeState, ExtractedValue,
    ExtractionRequest, ExtractionResult, FieldKind,
};
pub use fields::FieldEntry;
pub use host::AsyncHostChannel;
pub use registry::{BoundaryHandle, PointerRegistry, Retained};
pub use state::{ReleasedContext, StateContainer};

/// Initialize structured JSON logging on stderr.
///
/// The filter comes from `SINSP_PLUGIN_LOG`, then `RUST_LOG`, then `warn`.
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("SINSP_PLUGIN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
