//! Backend-neutral core of `morp`: the codec (C1), connection config (C2),
//! interface contract (C3), registry (C7), and message model (C8)
//! described in `SPEC_FULL.md`. Concrete backends live in their own
//! crates (`morp-postgres`, `morp-dropfile`, `morp-sqs`) and implement
//! [`interface::Interface`].

pub mod codec;
pub mod config;
pub mod error;
pub mod interface;
pub mod logging;
pub mod message;
pub mod registry;
pub mod value;

pub use config::{Backend, ConnectionConfig};
pub use error::{CodecError, ConfigError, InterfaceError};
pub use interface::{compute_release_delay, Interface};
pub use value::{Fields, FieldsExt, Value};
