//! Shader library.
//!
//! Loads compiled shader binaries, indexes them by function name, and owns
//! every pipeline reflection, descriptor-set layout, and pipeline layout
//! derived from them. Caches are never evicted; everything is released at
//! `shutdown`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ash::vk;
use log::{debug, warn};

use crate::bitset::DynamicBufferMask;
use crate::gpu::GpuApi;
use crate::pipeline::PipelineReflection;
use crate::reflect::{ModuleReflection, ReflectionEngine};
use crate::Error;

/// Entry-point name a single-function binary conventionally exports.
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// File extension of compiled shader binaries.
const SHADER_EXTENSION: &str = "spv";

/// One loaded shader binary with its reflection and native module handle.
pub struct ShaderModule {
    name: String,
    words: Vec<u32>,
    entry_points: Vec<String>,
    reflection: Box<dyn ModuleReflection>,
    handle: vk::ShaderModule,
}

impl ShaderModule {
    /// Name the module was loaded under (its source file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The binary word stream.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Entry points the binary exports.
    pub fn entry_points(&self) -> &[String] {
        &self.entry_points
    }

    /// The native module handle.
    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// The module's reflection.
    pub fn reflection(&self) -> &dyn ModuleReflection {
        self.reflection.as_ref()
    }

    /// Entry point to hand the reflection engine when `function` runs as a
    /// stage: the conventional default name for a default-only module, the
    /// requested name verbatim otherwise.
    pub fn stage_entry_point<'a>(&self, function: &'a str) -> &'a str {
        if self.has_default_entry_point_only() {
            DEFAULT_ENTRY_POINT
        } else {
            function
        }
    }

    fn has_default_entry_point_only(&self) -> bool {
        self.entry_points.len() == 1 && self.entry_points[0] == DEFAULT_ENTRY_POINT
    }
}

/// Identity of one pipeline's resource signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineLayoutKey {
    /// Vertex stage plus optional fragment stage.
    Graphics {
        vertex: String,
        fragment: Option<String>,
    },
    /// Single compute stage.
    Compute { function: String },
}

impl PipelineLayoutKey {
    pub fn graphics(vertex: &str, fragment: Option<&str>) -> Self {
        Self::Graphics {
            vertex: vertex.to_string(),
            fragment: fragment.map(str::to_string),
        }
    }

    pub fn compute(function: &str) -> Self {
        Self::Compute {
            function: function.to_string(),
        }
    }
}

/// Supplies the per-set dynamic-buffer configuration at pipeline-layout
/// assembly time. Queried once per set per assembly call; sets without an
/// entry report the empty mask.
pub trait DynamicBufferState {
    fn dynamic_buffers_for(&self, set: u32) -> DynamicBufferMask;
}

/// No dynamic buffers anywhere.
impl DynamicBufferState for () {
    fn dynamic_buffers_for(&self, _set: u32) -> DynamicBufferMask {
        DynamicBufferMask::empty()
    }
}

impl DynamicBufferState for HashMap<u32, DynamicBufferMask> {
    fn dynamic_buffers_for(&self, set: u32) -> DynamicBufferMask {
        self.get(&set).copied().unwrap_or_default()
    }
}

/// Indexes loaded shader modules by function name and owns every derived
/// reflection and native layout object.
///
/// Not internally synchronized: concurrent use requires external mutual
/// exclusion.
#[derive(Default)]
pub struct ShaderLibrary {
    modules: Vec<ShaderModule>,
    functions: HashMap<String, usize>,
    reflections: HashMap<PipelineLayoutKey, PipelineReflection>,
    pipeline_layouts: HashMap<PipelineLayoutKey, vk::PipelineLayout>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.spv` file in `dir`. Order among files is not
    /// significant; other files are ignored.
    pub fn load_directory(
        &mut self,
        gpu: &dyn GpuApi,
        engine: &dyn ReflectionEngine,
        dir: &Path,
    ) -> Result<(), Error> {
        for entry in fs::read_dir(dir).map_err(Error::Io)? {
            let path = entry.map_err(Error::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SHADER_EXTENSION) {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let bytes = fs::read(&path).map_err(Error::Io)?;
            self.load_binary(gpu, engine, &name, &bytes)?;
        }
        Ok(())
    }

    /// Load one compiled binary under `name` (its source file stem).
    pub fn load_binary(
        &mut self,
        gpu: &dyn GpuApi,
        engine: &dyn ReflectionEngine,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let words = words_from_bytes(name, bytes)?;
        self.load_words(gpu, engine, name, words)
    }

    /// Load a binary already decoded to words.
    ///
    /// A module whose only entry point is the conventional default name is
    /// indexed under `name`; otherwise every entry-point name maps to it.
    /// Duplicate function names: last loaded wins.
    pub fn load_words(
        &mut self,
        gpu: &dyn GpuApi,
        engine: &dyn ReflectionEngine,
        name: &str,
        words: Vec<u32>,
    ) -> Result<(), Error> {
        let reflection = engine.reflect(&words)?;
        let entry_points = reflection.entry_points();
        let handle = gpu.create_shader_module(&words)?;

        let index = self.modules.len();
        self.modules.push(ShaderModule {
            name: name.to_string(),
            words,
            entry_points: entry_points.clone(),
            reflection,
            handle,
        });

        if self.modules[index].has_default_entry_point_only() {
            self.index_function(name, index);
        } else {
            for entry_point in &entry_points {
                self.index_function(entry_point, index);
            }
        }

        debug!(
            "loaded shader module {:?} ({} entry points)",
            name,
            entry_points.len()
        );
        Ok(())
    }

    fn index_function(&mut self, function: &str, index: usize) {
        if let Some(previous) = self.functions.insert(function.to_string(), index) {
            warn!(
                "shader function {:?} redefined by module {:?}; was provided by module {:?}",
                function, self.modules[index].name, self.modules[previous].name
            );
        }
    }

    /// The module providing `function`, if any.
    pub fn find_module(&self, function: &str) -> Option<&ShaderModule> {
        self.functions.get(function).map(|&i| &self.modules[i])
    }

    /// The merged reflection for `key`, if it has been built.
    pub fn reflection_for(&self, key: &PipelineLayoutKey) -> Option<&PipelineReflection> {
        self.reflections.get(key)
    }

    /// Number of loaded modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    fn module_for(&self, function: &str) -> Result<&ShaderModule, Error> {
        self.find_module(function)
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))
    }

    /// Resolve `key` into per-stage (entry point, reflection, stage) tuples.
    fn stage_tuples(
        &self,
        key: &PipelineLayoutKey,
    ) -> Result<Vec<(String, &dyn ModuleReflection, vk::ShaderStageFlags)>, Error> {
        let mut tuples = Vec::new();
        match key {
            PipelineLayoutKey::Graphics { vertex, fragment } => {
                let module = self.module_for(vertex)?;
                tuples.push((
                    module.stage_entry_point(vertex).to_string(),
                    module.reflection(),
                    vk::ShaderStageFlags::VERTEX,
                ));
                if let Some(fragment) = fragment {
                    let module = self.module_for(fragment)?;
                    tuples.push((
                        module.stage_entry_point(fragment).to_string(),
                        module.reflection(),
                        vk::ShaderStageFlags::FRAGMENT,
                    ));
                }
            }
            PipelineLayoutKey::Compute { function } => {
                let module = self.module_for(function)?;
                tuples.push((
                    module.stage_entry_point(function).to_string(),
                    module.reflection(),
                    vk::ShaderStageFlags::COMPUTE,
                ));
            }
        }
        Ok(tuples)
    }

    /// Get or build the full pipeline layout for `key`.
    ///
    /// The cache is keyed by `key` alone: the dynamic-buffer configuration
    /// supplied by `dynamic_state` is fixed at first use per key. An
    /// unknown function name is a configuration error the caller must treat
    /// as unrecoverable.
    pub fn pipeline_layout_for(
        &mut self,
        gpu: &dyn GpuApi,
        key: &PipelineLayoutKey,
        dynamic_state: &dyn DynamicBufferState,
    ) -> Result<vk::PipelineLayout, Error> {
        if let Some(&layout) = self.pipeline_layouts.get(key) {
            return Ok(layout);
        }

        if !self.reflections.contains_key(key) {
            let reflection = {
                let tuples = self.stage_tuples(key)?;
                PipelineReflection::merge(&tuples)
            };
            self.reflections.insert(key.clone(), reflection);
        }

        let mut set_layouts = Vec::new();
        let mut push_constant_ranges = Vec::new();
        if let Some(reflection) = self.reflections.get_mut(key) {
            // The native API wants a dense, gap-free layout array: sets with
            // no declared resources still get an empty layout.
            if let Some(last_set) = reflection.last_set() {
                for set in 0..=last_set {
                    let dynamic_buffers = dynamic_state.dynamic_buffers_for(set);
                    set_layouts.push(reflection.layout_for(gpu, set, dynamic_buffers)?);
                }
            }
            push_constant_ranges = reflection.push_constant_ranges();
        }

        let layout = gpu.create_pipeline_layout(&set_layouts, &push_constant_ranges)?;
        debug!(
            "built pipeline layout for {:?} ({} sets, {} push constant ranges)",
            key,
            set_layouts.len(),
            push_constant_ranges.len()
        );
        self.pipeline_layouts.insert(key.clone(), layout);
        Ok(layout)
    }

    /// Release every native object this library created, exactly once.
    pub fn shutdown(&mut self, gpu: &dyn GpuApi) {
        for (_, layout) in self.pipeline_layouts.drain() {
            gpu.destroy_pipeline_layout(layout);
        }
        for (_, mut reflection) in self.reflections.drain() {
            reflection.shutdown(gpu);
        }
        for module in self.modules.drain(..) {
            gpu.destroy_shader_module(module.handle);
        }
        self.functions.clear();
    }
}

/// Decode a binary into little-endian words.
fn words_from_bytes(name: &str, bytes: &[u8]) -> Result<Vec<u32>, Error> {
    if bytes.len() % 4 != 0 {
        return Err(Error::InvalidBinary(format!(
            "{}: byte length {} is not word aligned",
            name,
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mock::CountingGpu;
    use crate::reflect::{
        AccessQualifier, BindingPath, BindingRange, RecordedEntryPoint, RecordedReflection,
        ResourceRecord, ResourceType,
    };

    // -------------------------------------------------------
    // Test reflection engine
    // -------------------------------------------------------

    /// Maps the first word of a binary to a recorded reflection.
    #[derive(Default)]
    struct TestEngine {
        by_id: HashMap<u32, RecordedReflection>,
    }

    impl TestEngine {
        fn insert(&mut self, id: u32, reflection: RecordedReflection) {
            self.by_id.insert(id, reflection);
        }
    }

    impl ReflectionEngine for TestEngine {
        fn reflect(&self, words: &[u32]) -> Result<Box<dyn ModuleReflection>, Error> {
            let id = words
                .first()
                .copied()
                .ok_or_else(|| Error::Reflection("empty module".to_string()))?;
            self.by_id
                .get(&id)
                .cloned()
                .map(|r| Box::new(r) as Box<dyn ModuleReflection>)
                .ok_or_else(|| Error::Reflection(format!("unknown module {}", id)))
        }
    }

    fn resource(ty: ResourceType, path: BindingPath, name: &str) -> ResourceRecord {
        ResourceRecord {
            ty,
            path,
            name: name.to_string(),
            access: AccessQualifier::ReadOnly,
            range: BindingRange::default(),
        }
    }

    fn entry(name: &str, resources: Vec<ResourceRecord>) -> RecordedEntryPoint {
        let mut entry = RecordedEntryPoint::new(name);
        entry.resources = resources;
        entry
    }

    // -------------------------------------------------------
    // Module loading and function resolution
    // -------------------------------------------------------

    #[test]
    fn test_default_entry_point_module_is_indexed_by_file_stem() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(DEFAULT_ENTRY_POINT, vec![])]),
        );

        let mut library = ShaderLibrary::new();
        library
            .load_words(&gpu, &engine, "sky_frag", vec![1])
            .unwrap();

        let module = library.find_module("sky_frag").unwrap();
        assert_eq!(module.name(), "sky_frag");
        assert_eq!(module.stage_entry_point("sky_frag"), DEFAULT_ENTRY_POINT);
        assert!(library.find_module(DEFAULT_ENTRY_POINT).is_none());
    }

    #[test]
    fn test_multi_entry_point_module_is_indexed_by_entry_points() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![
                entry("vs_main", vec![]),
                entry("fs_main", vec![]),
            ]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "scene", vec![1]).unwrap();

        assert!(library.find_module("vs_main").is_some());
        assert!(library.find_module("fs_main").is_some());
        assert!(library.find_module("scene").is_none());
        // Genuine entry points resolve verbatim.
        let module = library.find_module("vs_main").unwrap();
        assert_eq!(module.stage_entry_point("vs_main"), "vs_main");
    }

    #[test]
    fn test_duplicate_function_name_last_loaded_wins() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(DEFAULT_ENTRY_POINT, vec![])]),
        );
        engine.insert(
            2,
            RecordedReflection::new(vec![entry(DEFAULT_ENTRY_POINT, vec![])]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "blur", vec![1]).unwrap();
        library.load_words(&gpu, &engine, "blur", vec![2]).unwrap();

        assert_eq!(library.module_count(), 2);
        let module = library.find_module("blur").unwrap();
        assert_eq!(module.words(), &[2]);
    }

    #[test]
    fn test_unknown_function_is_a_fatal_lookup_failure() {
        let gpu = CountingGpu::default();
        let mut library = ShaderLibrary::new();

        let result =
            library.pipeline_layout_for(&gpu, &PipelineLayoutKey::compute("missing"), &());
        match result {
            Err(Error::UnknownFunction(name)) => assert_eq!(name, "missing"),
            other => panic!("expected UnknownFunction, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_misaligned_binary_is_rejected() {
        let gpu = CountingGpu::default();
        let engine = TestEngine::default();
        let mut library = ShaderLibrary::new();

        let result = library.load_binary(&gpu, &engine, "bad", &[0, 1, 2]);
        assert!(matches!(result, Err(Error::InvalidBinary(_))));
    }

    // -------------------------------------------------------
    // Pipeline layout assembly
    // -------------------------------------------------------

    #[test]
    fn test_graphics_pipeline_merges_shared_uniform_buffer() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![
                entry(
                    "vs_main",
                    vec![resource(
                        ResourceType::UniformBuffer,
                        BindingPath::new(0, 0),
                        "globals",
                    )],
                ),
                entry(
                    "fs_main",
                    vec![resource(
                        ResourceType::UniformBuffer,
                        BindingPath::new(0, 0),
                        "globals",
                    )],
                ),
            ]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "scene", vec![1]).unwrap();

        let key = PipelineLayoutKey::graphics("vs_main", Some("fs_main"));
        library.pipeline_layout_for(&gpu, &key, &()).unwrap();

        let reflection = library.reflection_for(&key).unwrap();
        assert_eq!(reflection.resources().len(), 1);
        assert_eq!(
            reflection.resources()[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );

        let state = gpu.state.borrow();
        assert_eq!(state.set_layouts.len(), 1);
        let bindings = &state.set_layouts[0];
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].binding, 0);
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(
            bindings[0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_compute_pipeline_collects_push_constant_range() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        let main = entry(
            DEFAULT_ENTRY_POINT,
            vec![ResourceRecord {
                ty: ResourceType::PushConstantBuffer,
                path: BindingPath::push_constant(),
                name: "params".to_string(),
                access: AccessQualifier::ReadOnly,
                range: BindingRange { offset: 0, size: 16 },
            }],
        );
        engine.insert(1, RecordedReflection::new(vec![main]));

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "culling", vec![1]).unwrap();

        let key = PipelineLayoutKey::compute("culling");
        library.pipeline_layout_for(&gpu, &key, &()).unwrap();

        let state = gpu.state.borrow();
        // No real set: no descriptor-set layouts at all.
        assert!(state.set_layouts.is_empty());
        assert_eq!(state.pipeline_layouts.len(), 1);
        let (set_layouts, ranges) = &state.pipeline_layouts[0];
        assert!(set_layouts.is_empty());
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].size, 16);
    }

    #[test]
    fn test_set_layout_array_is_dense_with_empty_middle_set() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(
                DEFAULT_ENTRY_POINT,
                vec![
                    resource(ResourceType::UniformBuffer, BindingPath::new(0, 0), "a"),
                    resource(ResourceType::SampledImage, BindingPath::new(2, 0), "b"),
                ],
            )]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "terrain", vec![1]).unwrap();

        let key = PipelineLayoutKey::compute("terrain");
        library.pipeline_layout_for(&gpu, &key, &()).unwrap();

        let state = gpu.state.borrow();
        assert_eq!(state.set_layouts.len(), 3);
        assert_eq!(state.set_layouts[0].len(), 1);
        assert!(state.set_layouts[1].is_empty());
        assert_eq!(state.set_layouts[2].len(), 1);
        let (set_layouts, _) = &state.pipeline_layouts[0];
        assert_eq!(set_layouts.len(), 3);
    }

    #[test]
    fn test_pipeline_layout_cache_hits_by_key() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(
                DEFAULT_ENTRY_POINT,
                vec![resource(
                    ResourceType::UniformBuffer,
                    BindingPath::new(0, 0),
                    "a",
                )],
            )]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "post", vec![1]).unwrap();

        let key = PipelineLayoutKey::compute("post");
        let first = library.pipeline_layout_for(&gpu, &key, &()).unwrap();

        // Same key, different dynamic state: the cached layout is reused
        // as-is (dynamic configuration is fixed at first use per key).
        let mut dynamic = HashMap::new();
        dynamic.insert(0u32, DynamicBufferMask::empty().with(0));
        let second = library.pipeline_layout_for(&gpu, &key, &dynamic).unwrap();

        assert_eq!(first, second);
        let state = gpu.state.borrow();
        assert_eq!(state.pipeline_layouts.len(), 1);
        assert_eq!(state.set_layouts.len(), 1);
    }

    #[test]
    fn test_dynamic_state_selects_dynamic_descriptors_at_first_use() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(
                DEFAULT_ENTRY_POINT,
                vec![resource(
                    ResourceType::UniformBuffer,
                    BindingPath::new(0, 0),
                    "object",
                )],
            )]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "alias", vec![1]).unwrap();

        let mut dynamic = HashMap::new();
        dynamic.insert(0u32, DynamicBufferMask::empty().with(0));
        library
            .pipeline_layout_for(&gpu, &PipelineLayoutKey::compute("alias"), &dynamic)
            .unwrap();

        let state = gpu.state.borrow();
        assert_eq!(
            state.set_layouts[0][0].descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
    }

    #[test]
    fn test_shutdown_releases_every_native_object_once() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            1,
            RecordedReflection::new(vec![entry(
                DEFAULT_ENTRY_POINT,
                vec![resource(
                    ResourceType::UniformBuffer,
                    BindingPath::new(0, 0),
                    "a",
                )],
            )]),
        );

        let mut library = ShaderLibrary::new();
        library.load_words(&gpu, &engine, "world", vec![1]).unwrap();
        library
            .pipeline_layout_for(&gpu, &PipelineLayoutKey::compute("world"), &())
            .unwrap();
        library.shutdown(&gpu);

        let state = gpu.state.borrow();
        assert_eq!(state.shader_modules_created, 1);
        assert_eq!(state.shader_modules_destroyed, 1);
        assert_eq!(state.set_layouts.len(), 1);
        assert_eq!(state.set_layouts_destroyed, 1);
        assert_eq!(state.pipeline_layouts.len(), 1);
        assert_eq!(state.pipeline_layouts_destroyed, 1);
        assert_eq!(library.module_count(), 0);
    }

    // -------------------------------------------------------
    // Directory loading
    // -------------------------------------------------------

    #[test]
    fn test_load_directory_picks_up_spv_files_only() {
        let gpu = CountingGpu::default();
        let mut engine = TestEngine::default();
        engine.insert(
            7,
            RecordedReflection::new(vec![entry(DEFAULT_ENTRY_POINT, vec![])]),
        );

        let dir = std::env::temp_dir().join(format!(
            "shader-layout-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fog.spv"), 7u32.to_le_bytes()).unwrap();
        fs::write(dir.join("notes.txt"), b"not a shader").unwrap();

        let mut library = ShaderLibrary::new();
        library.load_directory(&gpu, &engine, &dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();

        assert_eq!(library.module_count(), 1);
        assert!(library.find_module("fog").is_some());
    }
}
