//! Structured reflection of SPIR-V shader module interfaces.
//!
//! Frame capture and replay needs to know, for every shader it meets, the
//! exact shape of its interface: which inputs and outputs occupy which
//! locations, which descriptor bindings hold which blocks and textures,
//! and the precise byte offset of every block member under the packing
//! rules the producing compiler used. This crate takes a decoded module
//! (an [`ir::Module`]) and an entry point and produces that description as
//! a plain-data [`ReflectionResult`].
//!
//! The interesting parts:
//!
//! - **Layout recovery.** Block members normally carry explicit offset and
//!   stride decorations, but when a stride is missing the engine computes
//!   the member's size under the scalar, std430 and std140 models and
//!   picks the largest stride that fits the available span, which agrees
//!   with whichever model the producer actually used.
//! - **Interface flattening.** Nested struct/array/matrix outputs are
//!   linearized into flat signature slots with register indices and
//!   channel masks, the way capture-side consumers expect to see them.
//! - **Buffer-device-address pointers.** Pointee types are interned into a
//!   small table so that self-referencing types (linked lists) reflect
//!   without recursing forever.
//! - **Transform-feedback patching.** [`add_xfb_annotations`] rewrites a
//!   module in place so that one raster stream's outputs can be captured
//!   through transform feedback.
//!
//! Reflection never mutates the module; one call produces one owned
//! result, and independent calls can run in parallel on different modules.
//!
//! ```
//! use spirv_reflection::{reflect, ReflectOptions, ShaderStage};
//! use spirv_reflection::ir::{Module, SpirvVersion};
//!
//! let module = Module::new(SpirvVersion::V1_6);
//! // an entry point the module does not contain reflects to an empty result
//! let result = reflect(&module, "main", ShaderStage::Fragment, &ReflectOptions::default())
//!     .unwrap();
//! assert!(result.input_signature.is_empty());
//! ```

pub mod ir;

mod interface;
mod layout;
mod pointers;
mod reflect;
mod resources;
mod types;
mod xfb;

pub use self::{
    reflect::{reflect, ReflectOptions},
    types::*,
    xfb::add_xfb_annotations,
};

use self::ir::Id;

/// A fatal reflection failure: the module is malformed.
///
/// Recoverable oddities (unknown decorations, missing entry points,
/// override misses) are logged and worked around instead; see the
/// individual operations for what they tolerate.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReflectError {
    /// An instruction references an id that is never declared.
    #[error("id {0} is not declared in the module")]
    UnknownId(Id),
    /// A variable whose type is not a pointer type.
    #[error("variable {0} does not have a pointer type")]
    NotAPointer(Id),
    /// Struct/array nesting beyond the supported depth; treated as hostile.
    #[error("struct or array nesting exceeds the supported depth")]
    NestingTooDeep,
    /// The pointer type table kept growing past the number of declared
    /// types.
    #[error("the module's pointer type graph does not settle")]
    PointerCycle,
}
