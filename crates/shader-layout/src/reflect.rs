//! Shader reflection boundary.
//!
//! SPIR-V reflection parsing is an external collaborator. This module
//! defines the record vocabulary the core consumes and the traits a
//! reflection backend implements. `RecordedReflection` is a plain-data
//! implementation any backend can populate; it is also what the tests use.

use crate::Error;

/// Resource classes a shader binary can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    UniformBuffer,
    StorageBuffer,
    UniformTexelBuffer,
    StorageTexelBuffer,
    SampledImage,
    StorageImage,
    Sampler,
    SubpassInput,
    PushConstantBuffer,
}

/// How a stage accesses a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessQualifier {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Byte range of a resource within its block. Meaningful for push
/// constants; zero for everything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BindingRange {
    pub offset: u32,
    pub size: u32,
}

/// (set, binding, array index) triple locating a shader resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingPath {
    pub set: u32,
    pub binding: u32,
    pub array_index: u32,
}

impl BindingPath {
    /// Sentinel set index for push constants. Not a real descriptor set:
    /// resources here never enter set-indexed layout derivation and never
    /// advance the highest-set computation.
    pub const PUSH_CONSTANT_SET: u32 = u32::MAX;

    /// Path at (set, binding), array index 0.
    pub const fn new(set: u32, binding: u32) -> Self {
        Self {
            set,
            binding,
            array_index: 0,
        }
    }

    /// Path of a push-constant block.
    pub const fn push_constant() -> Self {
        Self {
            set: Self::PUSH_CONSTANT_SET,
            binding: 0,
            array_index: 0,
        }
    }

    /// Whether this path is the push-constant sentinel.
    pub const fn is_push_constant(&self) -> bool {
        self.set == Self::PUSH_CONSTANT_SET
    }
}

/// One resource declaration enumerated from a module entry point.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub ty: ResourceType,
    pub path: BindingPath,
    pub name: String,
    pub access: AccessQualifier,
    pub range: BindingRange,
}

/// One specialisation constant enumerated from a module entry point.
#[derive(Debug, Clone)]
pub struct SpecialisationRecord {
    pub index: u32,
    pub constant_id: u32,
    pub name: String,
}

/// Per-module reflection queries.
///
/// All enumeration is synchronous and exhaustive; returned lists are in the
/// engine's declaration order and stable across calls. Entry-point selection
/// is a query parameter so one module can serve several pipeline stages.
pub trait ModuleReflection {
    /// Names of every entry point the binary exports.
    fn entry_points(&self) -> Vec<String>;

    /// Resources the given entry point declares.
    fn resources(&self, entry_point: &str) -> Vec<ResourceRecord>;

    /// Specialisation constants the given entry point declares.
    fn specialisation_constants(&self, entry_point: &str) -> Vec<SpecialisationRecord>;
}

/// Parses one compiled binary into a reflection object.
pub trait ReflectionEngine {
    fn reflect(&self, words: &[u32]) -> Result<Box<dyn ModuleReflection>, Error>;
}

/// Reflection data for one entry point of a recorded module.
#[derive(Debug, Clone, Default)]
pub struct RecordedEntryPoint {
    pub name: String,
    pub resources: Vec<ResourceRecord>,
    pub specialisation_constants: Vec<SpecialisationRecord>,
}

impl RecordedEntryPoint {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Plain-data reflection for a single module.
///
/// Reflection backends populate one of these per binary; unknown entry
/// points report empty lists.
#[derive(Debug, Clone, Default)]
pub struct RecordedReflection {
    entries: Vec<RecordedEntryPoint>,
}

impl RecordedReflection {
    pub fn new(entries: Vec<RecordedEntryPoint>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: RecordedEntryPoint) {
        self.entries.push(entry);
    }

    fn entry(&self, name: &str) -> Option<&RecordedEntryPoint> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl ModuleReflection for RecordedReflection {
    fn entry_points(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    fn resources(&self, entry_point: &str) -> Vec<ResourceRecord> {
        self.entry(entry_point)
            .map(|e| e.resources.clone())
            .unwrap_or_default()
    }

    fn specialisation_constants(&self, entry_point: &str) -> Vec<SpecialisationRecord> {
        self.entry(entry_point)
            .map(|e| e.specialisation_constants.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_sentinel() {
        let path = BindingPath::push_constant();
        assert!(path.is_push_constant());
        assert!(!BindingPath::new(0, 0).is_push_constant());
    }

    #[test]
    fn test_recorded_reflection_scopes_queries_by_entry_point() {
        let mut reflection = RecordedReflection::default();
        let mut main = RecordedEntryPoint::new("main");
        main.resources.push(ResourceRecord {
            ty: ResourceType::UniformBuffer,
            path: BindingPath::new(0, 0),
            name: "globals".to_string(),
            access: AccessQualifier::ReadOnly,
            range: BindingRange::default(),
        });
        reflection.push(main);

        assert_eq!(reflection.entry_points(), vec!["main".to_string()]);
        assert_eq!(reflection.resources("main").len(), 1);
        assert!(reflection.resources("other").is_empty());
        assert!(reflection.specialisation_constants("main").is_empty());
    }
}
