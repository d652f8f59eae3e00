//! Resource-binding layout derivation for Vulkan pipelines.
//!
//! Given reflected SPIR-V modules for the stages of a pipeline, this crate
//! merges their resource declarations across stages, derives descriptor-set
//! layouts and push-constant ranges, and caches every derived artifact so
//! repeated pipeline creation with the same shaders is free.
//!
//! The SPIR-V reflection engine and the Vulkan device are external
//! collaborators behind the [`ReflectionEngine`] and [`GpuApi`] traits.
//! Nothing here is internally synchronized; concurrent use of one
//! [`ShaderLibrary`] requires external mutual exclusion.

pub mod binding;
pub mod bitset;
pub mod gpu;
pub mod library;
pub mod pipeline;
pub mod reflect;

pub use binding::{classify, stages_from_flags, ArgumentUsage, Stage};
pub use bitset::{DynamicBufferMask, MAX_DYNAMIC_BUFFERS};
pub use gpu::{AshGpu, DescriptorBinding, GpuApi};
pub use library::{
    DynamicBufferState, PipelineLayoutKey, ShaderLibrary, ShaderModule, DEFAULT_ENTRY_POINT,
};
pub use pipeline::{
    descriptor_type_for, DescriptorSetLayoutKey, FunctionSpecialisation, PipelineReflection,
    ShaderResource,
};
pub use reflect::{
    AccessQualifier, BindingPath, BindingRange, ModuleReflection, RecordedEntryPoint,
    RecordedReflection, ReflectionEngine, ResourceRecord, ResourceType, SpecialisationRecord,
};

/// Errors that can occur while loading shaders or deriving layouts.
#[derive(Debug)]
pub enum Error {
    /// A pipeline referenced a function no loaded module provides. This is
    /// a configuration error; callers must treat it as unrecoverable.
    UnknownFunction(String),
    /// A shader binary is not a valid word stream.
    InvalidBinary(String),
    /// Filesystem failure while enumerating or reading binaries.
    Io(std::io::Error),
    /// The reflection engine rejected a binary.
    Reflection(String),
    /// Native object creation failed. Propagated, never retried.
    Gpu(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnknownFunction(name) => write!(f, "unknown shader function: {}", name),
            Error::InvalidBinary(msg) => write!(f, "invalid shader binary: {}", msg),
            Error::Io(err) => write!(f, "shader i/o error: {}", err),
            Error::Reflection(msg) => write!(f, "shader reflection error: {}", msg),
            Error::Gpu(msg) => write!(f, "gpu error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
