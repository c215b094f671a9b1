//! Types shared between the datalab execution core and its callers.
//!
//! The crate is deliberately serde-only: no I/O, no runtime. Everything a
//! caller needs to submit code and interpret results lives here, as does the
//! wire contract spoken with the in-sandbox runtime agent.

pub mod protocol;
pub mod wire;

pub use protocol::ExecutionMode;
pub use protocol::ExecutionRecord;
pub use protocol::ExecutionRequest;
pub use protocol::ExecutionStatus;
pub use protocol::Figure;
pub use protocol::ResultEnvelope;
pub use protocol::SerializedValue;
pub use protocol::SessionState;
pub use protocol::TableHandle;
pub use protocol::ValidationResult;
