//! Argument-reflection classification.
//!
//! Maps reflected resource declarations into the closed usage vocabulary a
//! higher-level binding API exposes, and Vulkan stage masks into the
//! cross-API stage vocabulary.

use ash::vk;

use crate::reflect::{AccessQualifier, ResourceType};

/// Usage categories the binding API can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentUsage {
    ConstantBuffer,
    InputAttachment,
    Sampler,
    Read,
    Write,
    ReadWrite,
}

/// Classify a resource declaration.
///
/// Combinations with no entry in the table return `None`: the resource
/// cannot be meaningfully exposed through the binding API. Never an error.
pub fn classify(ty: ResourceType, access: AccessQualifier) -> Option<ArgumentUsage> {
    use AccessQualifier::*;
    use ResourceType::*;

    match (ty, access) {
        (UniformBuffer, _) => Some(ArgumentUsage::ConstantBuffer),
        (SubpassInput, ReadOnly) => Some(ArgumentUsage::InputAttachment),
        (Sampler, _) => Some(ArgumentUsage::Sampler),
        (SampledImage, ReadOnly) => Some(ArgumentUsage::Read),
        (UniformTexelBuffer, ReadOnly) => Some(ArgumentUsage::Read),
        (StorageBuffer | StorageTexelBuffer | StorageImage, ReadOnly) => Some(ArgumentUsage::Read),
        (StorageBuffer | StorageTexelBuffer | StorageImage, WriteOnly) => {
            Some(ArgumentUsage::Write)
        }
        (StorageBuffer | StorageTexelBuffer | StorageImage, ReadWrite) => {
            Some(ArgumentUsage::ReadWrite)
        }
        _ => None,
    }
}

/// Cross-API shader stage vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Fragment,
    Compute,
}

impl Stage {
    /// Convert to Vulkan stage flags.
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Stage::Vertex => vk::ShaderStageFlags::VERTEX,
            Stage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Stage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Translate a Vulkan stage mask into the cross-API vocabulary.
///
/// One bit test per recognized stage; unrecognized bits are dropped.
pub fn stages_from_flags(flags: vk::ShaderStageFlags) -> Vec<Stage> {
    let mut stages = Vec::new();
    if flags.contains(vk::ShaderStageFlags::VERTEX) {
        stages.push(Stage::Vertex);
    }
    if flags.contains(vk::ShaderStageFlags::FRAGMENT) {
        stages.push(Stage::Fragment);
    }
    if flags.contains(vk::ShaderStageFlags::COMPUTE) {
        stages.push(Stage::Compute);
    }
    stages
}
