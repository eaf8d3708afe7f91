//! The reflection output data model.
//!
//! Everything in this module is plain data, created fresh per reflection
//! call and handed to the caller by value. Cross-references into the source
//! module (for the capture pipeline's patching passes) are carried as
//! [`Id`]s in [`PatchData`], never as borrows.

use crate::ir::Id;
use smallvec::SmallVec;

/// Sentinel for a binding number that the module never resolved.
///
/// Entries carrying this value sort after all resolved entries and are then
/// renumbered to binding 0.
pub const INVALID_BIND: u32 = u32::MAX;

/// Sentinel element count for a runtime-sized (unbounded) array.
pub const UNBOUNDED_ARRAY: u32 = 0;

/// A shader stage within a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    #[default]
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    Compute,
    Task,
    Mesh,
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
}

/// The variable type of a reflected value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VarType {
    Float,
    Double,
    Half,
    SInt,
    UInt,
    SShort,
    UShort,
    SLong,
    ULong,
    SByte,
    UByte,
    Bool,
    /// An aggregate; the member list describes the contents.
    Struct,
    /// A physical-storage-buffer pointer; `pointer_type_index` selects the
    /// pointee description from [`ReflectionResult::pointer_types`].
    GpuPointer,
    #[default]
    Unknown,
}

impl VarType {
    /// The byte width of one component of this type.
    pub const fn byte_size(self) -> u32 {
        match self {
            VarType::Double | VarType::SLong | VarType::ULong | VarType::GpuPointer => 8,
            VarType::Float | VarType::SInt | VarType::UInt | VarType::Bool => 4,
            VarType::Half | VarType::SShort | VarType::UShort => 2,
            VarType::SByte | VarType::UByte => 1,
            VarType::Struct | VarType::Unknown => 0,
        }
    }
}

/// A system value bound to a signature slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShaderBuiltin {
    #[default]
    Undefined,
    Position,
    PointSize,
    ClipDistance,
    CullDistance,
    VertexIndex,
    InstanceIndex,
    PrimitiveIndex,
    GsInstanceIndex,
    OutputControlPointIndex,
    RtIndex,
    ViewportIndex,
    OuterTessFactor,
    InsideTessFactor,
    PatchNumVertices,
    IsFrontFace,
    MsaaSampleIndex,
    MsaaSamplePosition,
    MsaaCoverage,
    DepthOutput,
    DepthOutputGreaterEqual,
    DepthOutputLessEqual,
    CullPrimitiveOutput,
    ShadingRateOutput,
    ColorOutput,
    GroupIndex,
    GroupThreadIndex,
    GroupFlatIndex,
    DispatchThreadIndex,
    GroupCount,
}

/// Texture dimensionality of a resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextureType {
    #[default]
    Unknown,
    Buffer,
    Texture1D,
    Texture1DArray,
    Texture2D,
    Texture2DArray,
    Texture2DMS,
    Texture2DMSArray,
    Texture3D,
    TextureRect,
    TextureCube,
    TextureCubeArray,
}

/// The output primitive topology of a geometry or mesh stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Topology {
    #[default]
    Unknown,
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

/// The type of a block member or buffer variable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderConstantType {
    pub base_type: VarType,
    pub rows: u8,
    pub columns: u8,
    /// Array element count. 1 for non-arrays, [`UNBOUNDED_ARRAY`] for
    /// runtime-sized arrays.
    pub elements: u32,
    /// Byte stride between array elements; set iff `elements != 1`.
    pub array_byte_stride: u32,
    /// Byte stride between matrix vectors; 0 when not a matrix or unknown.
    pub matrix_byte_stride: u32,
    pub row_major: bool,
    /// The source-level type name, when the module carries one.
    pub name: String,
    /// Ordered member list; non-empty iff `base_type` is `Struct`.
    pub members: Vec<ShaderConstant>,
    /// For `GpuPointer` members, the index of the pointee description in
    /// [`ReflectionResult::pointer_types`].
    pub pointer_type_index: Option<u32>,
}

impl ShaderConstantType {
    pub(crate) fn new() -> Self {
        ShaderConstantType {
            elements: 1,
            ..Default::default()
        }
    }
}

/// One node of a reflected constant-block member tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderConstant {
    pub name: String,
    /// Byte offset relative to the enclosing struct.
    pub byte_offset: u32,
    /// For specialization constants, the default literal as a raw bit
    /// pattern. 0 otherwise.
    pub default_value: u64,
    pub ty: ShaderConstantType,
}

/// A flattened input/output signature slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SigParameter {
    pub var_name: String,
    /// The register (location) index the slot occupies.
    pub reg_index: u32,
    pub system_value: ShaderBuiltin,
    pub var_type: VarType,
    pub component_count: u32,
    /// Mask of the register channels the slot occupies.
    pub reg_channel_mask: u8,
    /// Mask of the channels the shader statically uses.
    pub channel_used_mask: u8,
    /// The geometry vertex stream the slot belongs to.
    pub stream: u32,
    /// True for per-primitive mesh outputs.
    pub per_primitive: bool,
}

/// A uniform, push-constant, specialization or task-payload block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConstantBlock {
    pub name: String,
    pub fixed_bind_set_or_space: u32,
    pub fixed_bind_number: u32,
    pub bind_array_size: u32,
    pub variables: Vec<ShaderConstant>,
    /// False for push constants, specialization constants and task
    /// payloads, which occupy no descriptor binding.
    pub buffer_backed: bool,
    pub byte_size: u32,
}

/// A texture, texel buffer or storage-buffer resource.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderResource {
    pub name: String,
    pub texture_type: TextureType,
    pub is_texture: bool,
    pub is_input_attachment: bool,
    pub fixed_bind_set_or_space: u32,
    pub fixed_bind_number: u32,
    pub bind_array_size: u32,
    /// For buffer-typed resources the member tree; for textures, the
    /// sampled scalar type.
    pub variable_type: ShaderConstantType,
}

/// A standalone sampler binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShaderSampler {
    pub name: String,
    pub fixed_bind_set_or_space: u32,
    pub fixed_bind_number: u32,
    pub bind_array_size: u32,
}

/// The source location of one flattened signature slot: the global variable
/// that owns it plus the constant access chain that reaches it. Consumed by
/// the capture pipeline's patching passes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterfacePatch {
    pub id: Id,
    pub access_chain: SmallVec<[u32; 4]>,
}

/// Patch records parallel to the sorted signature lists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchData {
    pub inputs: Vec<InterfacePatch>,
    pub outputs: Vec<InterfacePatch>,
}

/// The complete reflected description of one entry point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReflectionResult {
    pub entry_point: String,
    pub stage: ShaderStage,
    pub input_signature: Vec<SigParameter>,
    pub output_signature: Vec<SigParameter>,
    pub constant_blocks: Vec<ConstantBlock>,
    pub samplers: Vec<ShaderSampler>,
    pub read_only_resources: Vec<ShaderResource>,
    pub read_write_resources: Vec<ShaderResource>,
    pub task_payload: Option<ConstantBlock>,
    /// Compute/task/mesh workgroup dimensions; zero for other stages.
    pub dispatch_threads_dimension: [u32; 3],
    pub output_topology: Topology,
    /// Physical-storage-buffer pointee descriptions, indexed by
    /// [`ShaderConstantType::pointer_type_index`].
    pub pointer_types: Vec<ShaderConstantType>,
    pub patch_data: PatchData,
}
