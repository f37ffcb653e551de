//! Time-series instruction algebra and shot compiler for time-sampled
//! device waveforms: a structural representation of per-channel
//! waveforms (component B), an expression evaluator (component C), lane
//! compilers (component D), channel-output combinators (component E),
//! and a shot-compiler facade (component F) that ties them together for
//! one device at a time.
//!
//! Device drivers, RPC transport, persistent storage, and GUI editors are
//! out of scope: this crate only defines the trait boundary
//! ([`shot::DeviceCompiler`]) a real driver must satisfy.

pub mod channel_output;
pub mod error;
pub mod expr;
pub mod instruction;
pub mod lane;
pub mod orchestrator;
pub mod shot;
pub mod timing;
pub mod units;
pub mod wire;

pub use error::{DeviceCompileError, EvaluationError, ResourceError, ShotCompileError, TimingError};
pub use instruction::{AlgebraError, Buffer, Dtype, Instruction};
pub use shot::{ChannelDeclaration, DeviceCompiler, Lane, ParameterMap, SequenceContext, ShotContext};
pub use timing::{Time, TimeStep};
