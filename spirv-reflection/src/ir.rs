//! The decoded module that reflection consumes.
//!
//! A [`Module`] is the output of the binary decoder: the word stream has
//! already been turned into id-indexed tables of types, constants,
//! decorations and global variables, plus entry-point records and the small
//! subset of function-body instructions that reflection cares about. All
//! cross-references between entities are [`Id`]s looked up through the
//! module, never owning pointers; an id that is not declared anywhere is
//! reported as [`ReflectError::UnknownId`] rather than being followed
//! blindly.

use crate::{ReflectError, ShaderStage};
use foldhash::{HashMap, HashSet};

/// A SPIR-V result id.
///
/// Ids are opaque; they only have meaning as keys into the tables of the
/// [`Module`] they were decoded from.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u32);

impl Id {
    #[inline]
    pub const fn new(value: u32) -> Self {
        Id(value)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl std::fmt::Debug for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// The version of the module, used to select the used-id strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpirvVersion {
    pub major: u32,
    pub minor: u32,
}

impl SpirvVersion {
    pub const V1_0: SpirvVersion = SpirvVersion { major: 1, minor: 0 };
    pub const V1_3: SpirvVersion = SpirvVersion { major: 1, minor: 3 };
    pub const V1_4: SpirvVersion = SpirvVersion { major: 1, minor: 4 };
    pub const V1_6: SpirvVersion = SpirvVersion { major: 1, minor: 6 };
}

/// The numeric kind of a scalar component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Float,
    SInt,
    UInt,
}

/// A scalar component type: numeric kind plus width in bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: u32,
}

impl Scalar {
    pub const F16: Scalar = Scalar { kind: ScalarKind::Float, width: 16 };
    pub const F32: Scalar = Scalar { kind: ScalarKind::Float, width: 32 };
    pub const F64: Scalar = Scalar { kind: ScalarKind::Float, width: 64 };
    pub const I32: Scalar = Scalar { kind: ScalarKind::SInt, width: 32 };
    pub const U32: Scalar = Scalar { kind: ScalarKind::UInt, width: 32 };
    pub const U64: Scalar = Scalar { kind: ScalarKind::UInt, width: 64 };

    /// Width in bytes.
    #[inline]
    pub const fn byte_width(self) -> u32 {
        self.width / 8
    }
}

/// The length of an array type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayLength {
    /// Length given by a constant (possibly specialization constant) id.
    Constant(Id),
    /// A runtime array: the trailing unsized member of a storage block.
    Unbounded,
}

/// One member of a struct type.
#[derive(Clone, Debug, PartialEq)]
pub struct StructMember {
    pub ty: Id,
    pub name: Option<String>,
    pub decorations: Decorations,
}

/// A struct type: named, with an ordered member list.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StructType {
    pub name: Option<String>,
    pub members: Vec<StructMember>,
}

/// Image dimensionality.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim {
    Dim1D,
    Dim2D,
    Dim3D,
    Cube,
    Rect,
    Buffer,
    SubpassData,
}

/// An image type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageType {
    /// The sampled (texel component) type id.
    pub sampled_type: Id,
    pub dim: Dim,
    pub arrayed: bool,
    pub multisampled: bool,
    /// SPIR-V `Sampled` operand: 1 = sampled, 2 = storage.
    pub sampled: u32,
}

/// A decoded type declaration.
///
/// Every variant a consumer can meet is spelled out so that the layout
/// engine, the flattener and the classifier are all forced to handle new
/// variants at compile time.
#[derive(Clone, Debug, PartialEq)]
pub enum DataType {
    Void,
    Bool,
    Scalar(Scalar),
    Vector {
        scalar: Scalar,
        component_count: u32,
    },
    Matrix {
        scalar: Scalar,
        rows: u32,
        columns: u32,
    },
    Array {
        element_type: Id,
        length: ArrayLength,
    },
    Struct(StructType),
    Pointer {
        storage_class: StorageClass,
        pointee: Id,
    },
    Image(ImageType),
    Sampler,
    SampledImage {
        image_type: Id,
    },
    RayQuery,
    AccelerationStructure,
}

/// The memory space a variable lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageClass {
    Input,
    Output,
    Uniform,
    UniformConstant,
    StorageBuffer,
    PushConstant,
    Private,
    Function,
    Workgroup,
    CrossWorkgroup,
    AtomicCounter,
    PhysicalStorageBuffer,
    TaskPayloadWorkgroup,
}

/// A system-defined interface variable, identified by decoration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    Position,
    PointSize,
    ClipDistance,
    CullDistance,
    VertexIndex,
    InstanceIndex,
    PrimitiveId,
    InvocationId,
    Layer,
    ViewportIndex,
    TessLevelOuter,
    TessLevelInner,
    PatchVertices,
    FragCoord,
    FrontFacing,
    SampleId,
    SamplePosition,
    SampleMask,
    FragDepth,
    WorkgroupSize,
    GlobalInvocationId,
    LocalInvocationId,
    LocalInvocationIndex,
    WorkgroupId,
    NumWorkgroups,
    CullPrimitive,
    PrimitiveShadingRate,
}

/// The merged decoration bag for one id (or one struct member).
///
/// Numeric decorations use [`Decorations::UNSET`] (all ones) as the "not
/// decorated" sentinel, matching the wire encoding of the decoder. When the
/// same decoration appears more than once the decoder keeps the last one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decorations {
    pub offset: u32,
    pub array_stride: u32,
    pub matrix_stride: u32,
    pub set: u32,
    pub binding: u32,
    pub location: u32,
    pub component: u32,
    pub spec_id: u32,
    pub stream: u32,
    pub xfb_buffer: u32,
    pub xfb_stride: u32,
    pub builtin: Option<Builtin>,
    pub row_major: bool,
    pub block: bool,
    pub buffer_block: bool,
    pub per_primitive: bool,
}

impl Decorations {
    /// Sentinel for numeric decorations that are not present.
    pub const UNSET: u32 = u32::MAX;

    pub const fn none() -> Self {
        Decorations {
            offset: Self::UNSET,
            array_stride: Self::UNSET,
            matrix_stride: Self::UNSET,
            set: Self::UNSET,
            binding: Self::UNSET,
            location: Self::UNSET,
            component: 0,
            spec_id: Self::UNSET,
            stream: 0,
            xfb_buffer: Self::UNSET,
            xfb_stride: Self::UNSET,
            builtin: None,
            row_major: false,
            block: false,
            buffer_block: false,
            per_primitive: false,
        }
    }
}

impl Default for Decorations {
    fn default() -> Self {
        Self::none()
    }
}

/// A decoded constant (or specialization constant).
#[derive(Clone, Debug, PartialEq)]
pub struct Constant {
    pub ty: Id,
    /// Raw bit pattern of the literal, in the low bits for narrow types.
    pub value: u64,
    /// Constituent constant ids, for composite constants.
    pub members: Vec<Id>,
    /// True for `OpSpecConstant*` declarations.
    pub specialized: bool,
    pub name: Option<String>,
}

impl Constant {
    pub fn scalar(ty: Id, value: u64) -> Self {
        Constant {
            ty,
            value,
            members: Vec::new(),
            specialized: false,
            name: None,
        }
    }
}

/// A global variable declaration. The type is always a pointer type.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub id: Id,
    pub ty: Id,
    pub storage_class: StorageClass,
    pub name: Option<String>,
}

/// An execution mode attached to an entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    LocalSize { x: u32, y: u32, z: u32 },
    LocalSizeId { x: Id, y: Id, z: Id },
    OutputPoints,
    OutputLineStrip,
    OutputTriangleStrip,
    OutputLines,
    OutputTriangles,
    DepthGreater,
    DepthLess,
    DepthReplacing,
    Xfb,
    /// An execution mode reflection does not interpret, kept as its raw
    /// enumerant so it can be reported in logs.
    Other(u32),
}

/// A named, stage-tagged entry point record.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub name: String,
    pub stage: ShaderStage,
    pub function: Id,
    /// The interface id list from the `OpEntryPoint` instruction. For
    /// SPIR-V 1.4+ this lists every global the entry point can reference.
    pub interface: Vec<Id>,
    pub execution_modes: Vec<ExecutionMode>,
}

/// Module capabilities that reflection reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Shader,
    Geometry,
    Tessellation,
    GeometryStreams,
    TransformFeedback,
    MeshShading,
    RayQuery,
    PhysicalStorageBufferAddresses,
    Other(u32),
}

/// The subset of function-body instructions that reflection inspects:
/// everything that can make a global variable "statically used", plus the
/// vertex-emission instructions the transform-feedback patcher rewrites.
#[derive(Clone, Debug, PartialEq)]
pub enum FunctionInst {
    Load { pointer: Id },
    Store { pointer: Id },
    AccessChain { base: Id, indices: Vec<Id> },
    FunctionCall { function: Id, arguments: Vec<Id> },
    Atomic { pointer: Id },
    EmitVertex { stream: u32 },
    EndPrimitive { stream: u32 },
}

/// A decoded function body.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Function {
    pub id: Id,
    pub instructions: Vec<FunctionInst>,
}

impl Function {
    pub fn new(id: Id) -> Self {
        Function {
            id,
            instructions: Vec::new(),
        }
    }
}

/// A decoded shader module, immutable for the duration of a reflection call.
///
/// The transform-feedback patcher is the one consumer that mutates a
/// `Module` (decorations, execution modes and emission instructions); it
/// requires exclusive access to the module instance it patches.
#[derive(Clone, Debug, Default)]
pub struct Module {
    version: SpirvVersion,
    capabilities: HashSet<Capability>,
    extensions: Vec<String>,
    types: HashMap<Id, DataType>,
    constants: HashMap<Id, Constant>,
    decorations: HashMap<Id, Decorations>,
    variables: HashMap<Id, Variable>,
    /// Global variable ids in declaration order.
    globals: Vec<Id>,
    /// Spec-constant ids in declaration order.
    spec_constants: Vec<Id>,
    entry_points: Vec<EntryPoint>,
    functions: Vec<Function>,
}

impl Default for SpirvVersion {
    fn default() -> Self {
        SpirvVersion::V1_0
    }
}

impl Module {
    pub fn new(version: SpirvVersion) -> Self {
        Module {
            version,
            ..Default::default()
        }
    }

    #[inline]
    pub fn version(&self) -> SpirvVersion {
        self.version
    }

    #[inline]
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn declare_capability(&mut self, capability: Capability) {
        self.capabilities.insert(capability);
    }

    pub fn declare_extension(&mut self, extension: impl Into<String>) {
        self.extensions.push(extension.into());
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn declare_type(&mut self, id: Id, ty: DataType) {
        self.types.insert(id, ty);
    }

    pub fn declare_constant(&mut self, id: Id, constant: Constant) {
        if constant.specialized {
            self.spec_constants.push(id);
        }
        self.constants.insert(id, constant);
    }

    pub fn declare_variable(&mut self, variable: Variable) {
        self.globals.push(variable.id);
        self.variables.insert(variable.id, variable);
    }

    pub fn declare_entry_point(&mut self, entry_point: EntryPoint) {
        self.entry_points.push(entry_point);
    }

    pub fn declare_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    /// Merges decorations onto an id; later writes win over earlier ones.
    pub fn decorate(&mut self, id: Id, f: impl FnOnce(&mut Decorations)) {
        f(self.decorations.entry(id).or_default());
    }

    /// Merges decorations onto one member of a struct type.
    pub fn decorate_member(
        &mut self,
        struct_id: Id,
        member: usize,
        f: impl FnOnce(&mut Decorations),
    ) {
        if let Some(DataType::Struct(st)) = self.types.get_mut(&struct_id) {
            if let Some(m) = st.members.get_mut(member) {
                f(&mut m.decorations);
            }
        }
    }

    /// Looks up a type declaration, treating an undeclared id as a
    /// malformed module.
    pub fn data_type(&self, id: Id) -> Result<&DataType, ReflectError> {
        self.types.get(&id).ok_or(ReflectError::UnknownId(id))
    }

    /// The number of declared types. Bounds fixed-point passes over the
    /// type graph.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn constant(&self, id: Id) -> Result<&Constant, ReflectError> {
        self.constants.get(&id).ok_or(ReflectError::UnknownId(id))
    }

    pub fn constants(&self) -> impl Iterator<Item = (Id, &Constant)> {
        self.constants.iter().map(|(&id, constant)| (id, constant))
    }

    pub fn variable(&self, id: Id) -> Result<&Variable, ReflectError> {
        self.variables.get(&id).ok_or(ReflectError::UnknownId(id))
    }

    /// The decoration bag for an id. Undecorated ids report every
    /// decoration unset.
    pub fn decorations(&self, id: Id) -> Decorations {
        self.decorations.get(&id).copied().unwrap_or_default()
    }

    /// Global variable ids in declaration order.
    pub fn global_variables(&self) -> impl Iterator<Item = &Variable> {
        self.globals.iter().map(|id| &self.variables[id])
    }

    /// Spec-constant ids in declaration order.
    pub fn spec_constants(&self) -> &[Id] {
        &self.spec_constants
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    /// Resolves an entry-point name and stage pair to its record.
    pub fn entry_point(&self, name: &str, stage: ShaderStage) -> Option<&EntryPoint> {
        self.entry_points
            .iter()
            .find(|ep| ep.name == name && ep.stage == stage)
    }

    pub(crate) fn entry_point_mut(
        &mut self,
        name: &str,
        stage: ShaderStage,
    ) -> Option<&mut EntryPoint> {
        self.entry_points
            .iter_mut()
            .find(|ep| ep.name == name && ep.stage == stage)
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub(crate) fn functions_mut(&mut self) -> &mut [Function] {
        &mut self.functions
    }

    pub fn function(&self, id: Id) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Evaluates a constant id to its integer value.
    pub fn constant_value(&self, id: Id) -> Result<u64, ReflectError> {
        Ok(self.constant(id)?.value)
    }

    /// Resolves an array length to an element count, `None` meaning
    /// runtime-sized.
    pub fn array_length(&self, length: ArrayLength) -> Result<Option<u64>, ReflectError> {
        match length {
            ArrayLength::Constant(id) => Ok(Some(self.constant_value(id)?)),
            ArrayLength::Unbounded => Ok(None),
        }
    }

    /// Follows a variable's pointer type to the pointee type id.
    pub fn variable_pointee(&self, variable: &Variable) -> Result<Id, ReflectError> {
        match self.data_type(variable.ty)? {
            DataType::Pointer { pointee, .. } => Ok(*pointee),
            _ => Err(ReflectError::NotAPointer(variable.id)),
        }
    }

    /// Strips the capability/decoration state the transform-feedback
    /// patcher owns from an id.
    pub(crate) fn clear_xfb_decorations(&mut self, id: Id) {
        if let Some(dec) = self.decorations.get_mut(&id) {
            dec.xfb_buffer = Decorations::UNSET;
            dec.xfb_stride = Decorations::UNSET;
            dec.stream = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_id_is_malformed() {
        let module = Module::new(SpirvVersion::V1_0);
        assert!(matches!(
            module.data_type(Id::new(42)),
            Err(ReflectError::UnknownId(id)) if id == Id::new(42)
        ));
    }

    #[test]
    fn decorations_default_to_unset() {
        let module = Module::new(SpirvVersion::V1_0);
        let dec = module.decorations(Id::new(1));
        assert_eq!(dec.offset, Decorations::UNSET);
        assert_eq!(dec.binding, Decorations::UNSET);
        assert_eq!(dec.component, 0);
        assert!(dec.builtin.is_none());
    }

    #[test]
    fn later_decorations_win() {
        let mut module = Module::new(SpirvVersion::V1_0);
        module.decorate(Id::new(3), |d| d.binding = 1);
        module.decorate(Id::new(3), |d| d.binding = 2);
        assert_eq!(module.decorations(Id::new(3)).binding, 2);
    }

    #[test]
    fn entry_point_lookup_is_stage_aware() {
        let mut module = Module::new(SpirvVersion::V1_0);
        module.declare_entry_point(EntryPoint {
            name: "main".into(),
            stage: ShaderStage::Vertex,
            function: Id::new(4),
            interface: vec![],
            execution_modes: vec![],
        });
        assert!(module.entry_point("main", ShaderStage::Vertex).is_some());
        assert!(module.entry_point("main", ShaderStage::Fragment).is_none());
        assert!(module.entry_point("other", ShaderStage::Vertex).is_none());
    }
}
