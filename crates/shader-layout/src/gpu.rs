//! GPU-API collaborator boundary.
//!
//! Native object creation goes through `GpuApi` so layout derivation stays
//! testable without a device. `AshGpu` is the production implementation
//! over an `ash::Device`.

use ash::vk;

use crate::Error;

/// One row of an ordered descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// Native Vulkan object creation and destruction.
///
/// Creation failures are fatal driver or resource-exhaustion states; callers
/// propagate them and never retry. Each created handle is destroyed exactly
/// once, at owner teardown.
pub trait GpuApi {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, Error>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, Error>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, words: &[u32]) -> Result<vk::ShaderModule, Error>;

    fn destroy_shader_module(&self, module: vk::ShaderModule);
}

/// `GpuApi` over a real Vulkan device.
pub struct AshGpu {
    device: ash::Device,
}

impl AshGpu {
    /// The device must outlive every handle created through this value.
    pub fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

impl GpuApi for AshGpu {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, Error> {
        let vk_bindings = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
            })
            .collect::<Vec<_>>();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);

        // SAFETY: device is valid; vk_bindings outlives the call.
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| Error::Gpu(format!("failed to create descriptor set layout: {:?}", e)))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: each layout is destroyed exactly once, at owner teardown.
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout, Error> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);

        // SAFETY: device is valid; the slices outlive the call.
        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| Error::Gpu(format!("failed to create pipeline layout: {:?}", e)))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: each layout is destroyed exactly once, at owner teardown.
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_shader_module(&self, words: &[u32]) -> Result<vk::ShaderModule, Error> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(words);

        // SAFETY: device is valid; words is a well-formed word stream.
        unsafe { self.device.create_shader_module(&create_info, None) }
            .map_err(|e| Error::Gpu(format!("failed to create shader module: {:?}", e)))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        // SAFETY: each module is destroyed exactly once, at owner teardown.
        unsafe { self.device.destroy_shader_module(module, None) }
    }
}
