//! Merged pipeline reflection and descriptor-set layout derivation.
//!
//! One `PipelineReflection` unifies the resource declarations of every stage
//! of a pipeline and owns the per-(set, dynamic-buffer mask) layout cache.

use std::collections::HashMap;

use ash::vk;
use log::debug;

use crate::bitset::DynamicBufferMask;
use crate::gpu::{DescriptorBinding, GpuApi};
use crate::reflect::{
    AccessQualifier, BindingPath, BindingRange, ModuleReflection, ResourceRecord, ResourceType,
};
use crate::Error;

/// A resource merged across every stage that declares it.
#[derive(Debug, Clone)]
pub struct ShaderResource {
    pub ty: ResourceType,
    pub path: BindingPath,
    pub name: String,
    pub access: AccessQualifier,
    pub range: BindingRange,
    /// Union of every stage that declared this path.
    pub stages: vk::ShaderStageFlags,
}

/// A specialisation constant, unique by index within a merged reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpecialisation {
    pub index: u32,
    pub name: String,
}

/// Cache key for one derived descriptor-set layout. Structural equality
/// only; equal keys always yield the same cached layout object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutKey {
    pub set: u32,
    pub dynamic_buffers: DynamicBufferMask,
}

/// Select the native descriptor kind for a resource.
///
/// Buffer kinds honor the per-position dynamic bit; every other kind maps
/// 1:1 and ignores it. Push-constant blocks have no descriptor kind.
pub fn descriptor_type_for(ty: ResourceType, dynamic: bool) -> Option<vk::DescriptorType> {
    match ty {
        ResourceType::UniformBuffer if dynamic => Some(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
        ResourceType::UniformBuffer => Some(vk::DescriptorType::UNIFORM_BUFFER),
        ResourceType::StorageBuffer if dynamic => Some(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
        ResourceType::StorageBuffer => Some(vk::DescriptorType::STORAGE_BUFFER),
        ResourceType::UniformTexelBuffer => Some(vk::DescriptorType::UNIFORM_TEXEL_BUFFER),
        ResourceType::StorageTexelBuffer => Some(vk::DescriptorType::STORAGE_TEXEL_BUFFER),
        ResourceType::SampledImage => Some(vk::DescriptorType::SAMPLED_IMAGE),
        ResourceType::StorageImage => Some(vk::DescriptorType::STORAGE_IMAGE),
        ResourceType::Sampler => Some(vk::DescriptorType::SAMPLER),
        ResourceType::SubpassInput => Some(vk::DescriptorType::INPUT_ATTACHMENT),
        ResourceType::PushConstantBuffer => None,
    }
}

/// Reflection data merged across the stages of one pipeline, plus the
/// descriptor-set layouts derived from it.
pub struct PipelineReflection {
    /// Merged resources, in merge insertion order.
    resources: Vec<ShaderResource>,
    by_path: HashMap<BindingPath, usize>,
    specialisations: Vec<FunctionSpecialisation>,
    /// Per set, the union of stages that touch it.
    set_stages: HashMap<u32, vk::ShaderStageFlags>,
    /// Highest set index among non-push-constant resources.
    last_set: Option<u32>,
    set_layouts: HashMap<DescriptorSetLayoutKey, vk::DescriptorSetLayout>,
}

impl PipelineReflection {
    /// Merge per-stage reflections into one unified map.
    ///
    /// Stage unions and the highest-set computation are order-independent.
    /// Specialisation-constant naming is not: on an index collision the
    /// first stage processed keeps its name. A path declared with different
    /// type or access in different stages keeps the first stage's data and
    /// only unions the stage flags; the merge does not validate consistency.
    pub fn merge(stages: &[(String, &dyn ModuleReflection, vk::ShaderStageFlags)]) -> Self {
        let mut merged = Self {
            resources: Vec::new(),
            by_path: HashMap::new(),
            specialisations: Vec::new(),
            set_stages: HashMap::new(),
            last_set: None,
            set_layouts: HashMap::new(),
        };

        for (entry_point, reflection, stage) in stages {
            for record in reflection.resources(entry_point) {
                merged.add_resource(record, *stage);
            }
            for constant in reflection.specialisation_constants(entry_point) {
                if !merged.specialisations.iter().any(|s| s.index == constant.index) {
                    merged.specialisations.push(FunctionSpecialisation {
                        index: constant.index,
                        name: constant.name,
                    });
                }
            }
        }

        merged
    }

    fn add_resource(&mut self, record: ResourceRecord, stage: vk::ShaderStageFlags) {
        match self.by_path.get(&record.path) {
            Some(&index) => {
                self.resources[index].stages |= stage;
            }
            None => {
                self.by_path.insert(record.path, self.resources.len());
                self.resources.push(ShaderResource {
                    ty: record.ty,
                    path: record.path,
                    name: record.name,
                    access: record.access,
                    range: record.range,
                    stages: stage,
                });
            }
        }

        // The push-constant sentinel is not a real set: it must not widen
        // any set's stage union nor advance the highest-set computation.
        if !record.path.is_push_constant() {
            *self.set_stages.entry(record.path.set).or_default() |= stage;
            self.last_set = Some(match self.last_set {
                Some(last) => last.max(record.path.set),
                None => record.path.set,
            });
        }
    }

    /// Merged resources, in merge insertion order.
    pub fn resources(&self) -> &[ShaderResource] {
        &self.resources
    }

    /// The merged resource at a path, if any stage declared one.
    pub fn resource_at(&self, path: BindingPath) -> Option<&ShaderResource> {
        self.by_path.get(&path).map(|&index| &self.resources[index])
    }

    /// Specialisation constants, first-seen order.
    pub fn specialisations(&self) -> &[FunctionSpecialisation] {
        &self.specialisations
    }

    /// Union of stages that touch `set`. Empty for untouched sets.
    pub fn active_stages(&self, set: u32) -> vk::ShaderStageFlags {
        self.set_stages.get(&set).copied().unwrap_or_default()
    }

    /// Highest set index among non-push-constant resources, or `None` when
    /// no real set is used (no descriptor-set layouts exist then).
    pub fn last_set(&self) -> Option<u32> {
        self.last_set
    }

    /// One push-constant range per push-constant resource, with the
    /// resource's merged stage union and byte range.
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        self.resources
            .iter()
            .filter(|r| r.ty == ResourceType::PushConstantBuffer)
            .map(|r| vk::PushConstantRange {
                stage_flags: r.stages,
                offset: r.range.offset,
                size: r.range.size,
            })
            .collect()
    }

    /// Get or build the layout for `(set, dynamic_buffers)`.
    ///
    /// Builds at most once per distinct key for the life of this
    /// reflection; the cache never invalidates or evicts.
    pub fn layout_for(
        &mut self,
        gpu: &dyn GpuApi,
        set: u32,
        dynamic_buffers: DynamicBufferMask,
    ) -> Result<vk::DescriptorSetLayout, Error> {
        let key = DescriptorSetLayoutKey {
            set,
            dynamic_buffers,
        };
        if let Some(&layout) = self.set_layouts.get(&key) {
            return Ok(layout);
        }

        let bindings = self.bindings_for(set, dynamic_buffers);
        let layout = gpu.create_descriptor_set_layout(&bindings)?;
        debug!(
            "built descriptor set layout: set {}, mask {:#x}, {} bindings",
            set,
            dynamic_buffers.bits(),
            bindings.len()
        );
        self.set_layouts.insert(key, layout);
        Ok(layout)
    }

    /// Ordered binding list for one set under a dynamic-buffer mask.
    ///
    /// The dynamic bit is looked up by position in this filtered list, not
    /// by binding number. Every binding carries the set's full stage union;
    /// per-binding narrowing is not supported.
    fn bindings_for(&self, set: u32, dynamic_buffers: DynamicBufferMask) -> Vec<DescriptorBinding> {
        let stage_flags = self.active_stages(set);
        let mut bindings = Vec::new();
        let mut position = 0u32;

        for resource in &self.resources {
            if resource.path.set != set || resource.ty == ResourceType::PushConstantBuffer {
                continue;
            }
            // A kind-less resource yields no binding rather than an error.
            if let Some(descriptor_type) =
                descriptor_type_for(resource.ty, dynamic_buffers.contains(position))
            {
                bindings.push(DescriptorBinding {
                    binding: resource.path.binding,
                    descriptor_type,
                    descriptor_count: 1,
                    stage_flags,
                });
            }
            position += 1;
        }

        bindings
    }

    /// Release every layout this reflection created, exactly once.
    pub fn shutdown(&mut self, gpu: &dyn GpuApi) {
        for (_, layout) in self.set_layouts.drain() {
            gpu.destroy_descriptor_set_layout(layout);
        }
    }
}
