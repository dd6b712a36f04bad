//! MathIDE Parse Layer
//!
//! The trusted boundary between raw model output and typed records.
//!
//! # Pipeline
//!
//! ```text
//! model text → locate_payload → ResilientDecoder → Value → typed record
//!                                   │
//!                                   ├─ 1. direct decode
//!                                   ├─ 2. expression escape repair
//!                                   ├─ 3. unrecognized escape doubling
//!                                   └─ 4. unrecognized escape stripping
//! ```
//!
//! # Example
//!
//! ```rust
//! use mathide_parse::records::{read_record, ApplyResponse};
//!
//! let text = r#"Sure! {"result": "\sin(x) = 0", "valid": true}"#;
//! let response: ApplyResponse = read_record(text).unwrap();
//! assert_eq!(response.result, r"\sin(x) = 0");
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
pub mod decoder;
pub mod error;
pub mod payload;
pub mod records;
pub mod repair;

// Re-exports for convenience
pub use decoder::{decode, Decoded, DecodeStage, ResilientDecoder};
pub use error::{DecodeError, StageFailure};
pub use payload::{locate_payload, PayloadShape};
pub use repair::{is_known_command, repair_expression_escapes, KNOWN_COMMANDS};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for decoding model responses
    pub use crate::decoder::{DecodeStage, ResilientDecoder};
    pub use crate::error::DecodeError;
    pub use crate::payload::{locate_payload, PayloadShape};
    pub use crate::records::{
        read_generation, read_record, ApplyResponse, BranchingResponse, CheckResponse,
        GenerationItem, ProgressResponse, ResponseRecord, VerificationResponse,
    };
}
