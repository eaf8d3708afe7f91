//! Assembly of the final reflection value.
//!
//! One call here drives the whole engine: classify the globals, flatten
//! the interface, gather specialization constants, fold in the execution
//! modes and resolve the pointer table. The result is a self-contained
//! value the caller owns; nothing borrows from the module.

use crate::{
    interface::{flatten_signature, sort_signature},
    ir::{Builtin, Decorations, ExecutionMode, Id, Module},
    layout::make_constant_block_variable,
    pointers::PointerTypeTable,
    resources::{classify_globals, finalize_bindings, StaticUse},
    types::{
        ConstantBlock, InterfacePatch, ReflectionResult, ShaderBuiltin, ShaderStage, SigParameter,
        Topology, INVALID_BIND,
    },
    ReflectError,
};
use foldhash::HashMap;
use tracing::{error, warn};

/// Per-call configuration.
#[derive(Clone, Debug, Default)]
pub struct ReflectOptions {
    /// Specialization-constant overrides, `(spec id, raw bits)`. Overrides
    /// replace the reflected default values and feed `LocalSizeId`
    /// evaluation. An id with no matching constant is warned about and
    /// skipped.
    pub specialization: Vec<(u32, u64)>,
    /// For modules from an API without static binding numbers, use the
    /// `Location` decoration as the binding number when `Binding` is
    /// absent.
    pub bindings_from_location: bool,
}

fn eval_constant(
    module: &Module,
    overrides: &HashMap<u32, u64>,
    id: Id,
) -> Result<u64, ReflectError> {
    let constant = module.constant(id)?;
    if constant.specialized {
        let spec_id = module.decorations(id).spec_id;
        if spec_id != Decorations::UNSET {
            if let Some(&value) = overrides.get(&spec_id) {
                return Ok(value);
            }
        }
    }
    Ok(constant.value)
}

/// Builds the synthetic specialization-constant block: one 8-byte slot per
/// spec-id-decorated constant, in declaration order, defaults copied from
/// the literals and then replaced by any caller overrides.
fn build_spec_block(
    module: &Module,
    options: &ReflectOptions,
    pointers: &mut PointerTypeTable,
) -> Result<Option<ConstantBlock>, ReflectError> {
    let mut entries: Vec<(u32, crate::types::ShaderConstant)> = Vec::new();
    for &id in module.spec_constants() {
        let dec = module.decorations(id);
        if dec.spec_id == Decorations::UNSET {
            // composites like WorkgroupSize have no spec id of their own
            continue;
        }
        let constant = module.constant(id)?;
        let name = constant
            .name
            .clone()
            .unwrap_or_else(|| format!("_spec{}", dec.spec_id));
        let mut member = make_constant_block_variable(
            module,
            name,
            constant.ty,
            Decorations::none(),
            pointers,
            0,
        )?;
        member.byte_offset = entries.len() as u32 * 8;
        member.default_value = constant.value;
        // composite constants copy each constituent's literal into the
        // matching member
        for (child, &constituent) in member.ty.members.iter_mut().zip(&constant.members) {
            child.default_value = module.constant(constituent)?.value;
        }
        entries.push((dec.spec_id, member));
    }

    for &(spec_id, value) in &options.specialization {
        match entries.iter_mut().find(|(id, _)| *id == spec_id) {
            Some((_, member)) => member.default_value = value,
            None => warn!(spec_id, "specialization override matches no constant in the module"),
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }
    let byte_size = entries.len() as u32 * 8;
    Ok(Some(ConstantBlock {
        name: "Specialization Constants".into(),
        fixed_bind_set_or_space: 0,
        fixed_bind_number: INVALID_BIND,
        bind_array_size: 1,
        variables: entries.into_iter().map(|(_, member)| member).collect(),
        buffer_backed: false,
        byte_size,
    }))
}

/// Workgroup dimensions, in precedence order: a `WorkgroupSize`-decorated
/// constant, then `LocalSizeId`, then literal `LocalSize` operands.
fn dispatch_dimensions(
    module: &Module,
    execution_modes: &[ExecutionMode],
    overrides: &HashMap<u32, u64>,
) -> Result<[u32; 3], ReflectError> {
    let workgroup_size = module
        .constants()
        .find(|&(id, _)| module.decorations(id).builtin == Some(Builtin::WorkgroupSize));
    if let Some((_, constant)) = workgroup_size {
        if let [x, y, z] = constant.members[..] {
            return Ok([
                eval_constant(module, overrides, x)? as u32,
                eval_constant(module, overrides, y)? as u32,
                eval_constant(module, overrides, z)? as u32,
            ]);
        }
    }

    for mode in execution_modes {
        if let ExecutionMode::LocalSizeId { x, y, z } = *mode {
            return Ok([
                eval_constant(module, overrides, x)? as u32,
                eval_constant(module, overrides, y)? as u32,
                eval_constant(module, overrides, z)? as u32,
            ]);
        }
    }
    for mode in execution_modes {
        if let ExecutionMode::LocalSize { x, y, z } = *mode {
            return Ok([x, y, z]);
        }
    }
    Ok([0, 0, 0])
}

fn apply_execution_modes(execution_modes: &[ExecutionMode], result: &mut ReflectionResult) {
    let rewrite_depth = |result: &mut ReflectionResult, replacement: ShaderBuiltin| {
        for param in &mut result.output_signature {
            if param.system_value == ShaderBuiltin::DepthOutput {
                param.system_value = replacement;
            }
        }
    };

    for mode in execution_modes {
        match mode {
            ExecutionMode::OutputPoints => result.output_topology = Topology::PointList,
            ExecutionMode::OutputLines => result.output_topology = Topology::LineList,
            ExecutionMode::OutputLineStrip => result.output_topology = Topology::LineStrip,
            ExecutionMode::OutputTriangles => result.output_topology = Topology::TriangleList,
            ExecutionMode::OutputTriangleStrip => result.output_topology = Topology::TriangleStrip,
            ExecutionMode::DepthGreater => {
                rewrite_depth(result, ShaderBuiltin::DepthOutputGreaterEqual)
            }
            ExecutionMode::DepthLess => rewrite_depth(result, ShaderBuiltin::DepthOutputLessEqual),
            ExecutionMode::DepthReplacing
            | ExecutionMode::Xfb
            | ExecutionMode::LocalSize { .. }
            | ExecutionMode::LocalSizeId { .. } => {}
            ExecutionMode::Other(raw) => {
                warn!(mode = raw, "ignoring unrecognized execution mode");
            }
        }
    }
}

/// Reflects one entry point of a module.
///
/// A missing entry point is not an error at this boundary: it is logged
/// and an empty result is returned so callers can degrade to "no
/// reflection available". Malformed modules (dangling ids, unresolvable
/// pointer graphs, hostile nesting) do fail the call.
pub fn reflect(
    module: &Module,
    entry_point: &str,
    stage: ShaderStage,
    options: &ReflectOptions,
) -> Result<ReflectionResult, ReflectError> {
    let Some(entry) = module.entry_point(entry_point, stage) else {
        error!(entry_point, ?stage, "entry point not found in module");
        return Ok(ReflectionResult::default());
    };

    let overrides: HashMap<u32, u64> = options.specialization.iter().copied().collect();
    let usage = StaticUse::build(module, entry);
    let mut pointers = PointerTypeTable::new();

    let mut classified =
        classify_globals(module, &usage, options.bindings_from_location, &mut pointers)?;
    if let Some(block) = build_spec_block(module, options, &mut pointers)? {
        classified.constant_blocks.push(block);
    }
    finalize_bindings(&mut classified);

    let mut input_signature: Vec<SigParameter> = Vec::new();
    let mut input_patches: Vec<InterfacePatch> = Vec::new();
    for &id in &classified.inputs {
        let (params, patches) =
            flatten_signature(module, module.variable(id)?, stage, true, &usage)?;
        input_signature.extend(params);
        input_patches.extend(patches);
    }
    sort_signature(&mut input_signature, &mut input_patches);

    let mut output_signature: Vec<SigParameter> = Vec::new();
    let mut output_patches: Vec<InterfacePatch> = Vec::new();
    for &id in &classified.outputs {
        let (params, patches) =
            flatten_signature(module, module.variable(id)?, stage, false, &usage)?;
        output_signature.extend(params);
        output_patches.extend(patches);
    }
    sort_signature(&mut output_signature, &mut output_patches);

    let mut result = ReflectionResult {
        entry_point: entry.name.clone(),
        stage,
        input_signature,
        output_signature,
        constant_blocks: classified.constant_blocks,
        samplers: classified.samplers,
        read_only_resources: classified.read_only,
        read_write_resources: classified.read_write,
        task_payload: classified.task_payload,
        dispatch_threads_dimension: dispatch_dimensions(
            module,
            &entry.execution_modes,
            &overrides,
        )?,
        output_topology: Topology::Unknown,
        pointer_types: Vec::new(),
        patch_data: crate::types::PatchData {
            inputs: input_patches,
            outputs: output_patches,
        },
    };
    apply_execution_modes(&entry.execution_modes, &mut result);
    result.pointer_types = pointers.resolve(module)?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        ArrayLength, Constant, DataType, EntryPoint, Scalar, SpirvVersion, StorageClass,
        StructMember, StructType, Variable,
    };
    use crate::types::VarType;

    const FLOAT: Id = Id::new(1);
    const INT: Id = Id::new(2);
    const VEC2: Id = Id::new(3);
    const IVEC2: Id = Id::new(4);
    const VEC4: Id = Id::new(5);
    const MAT4X3: Id = Id::new(6);
    const MAT2: Id = Id::new(7);

    fn base_types(module: &mut Module) {
        module.declare_type(FLOAT, DataType::Scalar(Scalar::F32));
        module.declare_type(INT, DataType::Scalar(Scalar::I32));
        module.declare_type(
            VEC2,
            DataType::Vector {
                scalar: Scalar::F32,
                component_count: 2,
            },
        );
        module.declare_type(
            IVEC2,
            DataType::Vector {
                scalar: Scalar::I32,
                component_count: 2,
            },
        );
        module.declare_type(
            VEC4,
            DataType::Vector {
                scalar: Scalar::F32,
                component_count: 4,
            },
        );
        module.declare_type(
            MAT4X3,
            DataType::Matrix {
                scalar: Scalar::F32,
                rows: 3,
                columns: 4,
            },
        );
        module.declare_type(
            MAT2,
            DataType::Matrix {
                scalar: Scalar::F32,
                rows: 2,
                columns: 2,
            },
        );
    }

    fn entry(module: &mut Module, stage: ShaderStage, interface: Vec<Id>) {
        module.declare_entry_point(EntryPoint {
            name: "main".into(),
            stage,
            function: Id::new(100),
            interface,
            execution_modes: vec![],
        });
    }

    fn member(ty: Id, name: &str, offset: u32, f: impl FnOnce(&mut Decorations)) -> StructMember {
        let mut decorations = Decorations::none();
        decorations.offset = offset;
        f(&mut decorations);
        StructMember {
            ty,
            name: Some(name.into()),
            decorations,
        }
    }

    /// The classic mixed uniform block: scalars, both matrix orders, an
    /// array, a nested struct and an explicit trailing offset.
    fn uniform_block_module() -> Module {
        let mut module = Module::new(SpirvVersion::V1_4);
        base_types(&mut module);

        let three = Id::new(10);
        module.declare_constant(three, Constant::scalar(INT, 3));
        let vec2_array = Id::new(11);
        module.declare_type(
            vec2_array,
            DataType::Array {
                element_type: VEC2,
                length: ArrayLength::Constant(three),
            },
        );
        module.decorate(vec2_array, |d| d.array_stride = 16);

        let inner = Id::new(12);
        module.declare_type(
            inner,
            DataType::Struct(StructType {
                name: Some("F".into()),
                members: vec![
                    member(FLOAT, "x", 0, |_| {}),
                    member(INT, "y", 4, |_| {}),
                    member(MAT2, "m", 16, |d| d.matrix_stride = 8),
                ],
            }),
        );

        let block = Id::new(13);
        module.declare_type(
            block,
            DataType::Struct(StructType {
                name: Some("Uniforms".into()),
                members: vec![
                    member(FLOAT, "a", 0, |_| {}),
                    member(MAT4X3, "b", 16, |d| d.matrix_stride = 16),
                    member(MAT4X3, "c", 80, |d| {
                        d.matrix_stride = 16;
                        d.row_major = true;
                    }),
                    member(IVEC2, "d", 128, |_| {}),
                    member(vec2_array, "e", 144, |_| {}),
                    member(inner, "f", 192, |_| {}),
                    member(VEC4, "g", 256, |_| {}),
                ],
            }),
        );
        module.decorate(block, |d| d.block = true);

        let ptr = Id::new(14);
        module.declare_type(
            ptr,
            DataType::Pointer {
                storage_class: StorageClass::Uniform,
                pointee: block,
            },
        );
        let var = Id::new(15);
        module.declare_variable(Variable {
            id: var,
            ty: ptr,
            storage_class: StorageClass::Uniform,
            name: Some("uniforms".into()),
        });
        module.decorate(var, |d| {
            d.set = 0;
            d.binding = 0;
        });
        entry(&mut module, ShaderStage::Vertex, vec![var]);
        module
    }

    #[test]
    fn uniform_block_offsets_and_size() {
        let module = uniform_block_module();
        let result = reflect(&module, "main", ShaderStage::Vertex, &ReflectOptions::default())
            .unwrap();

        assert_eq!(result.constant_blocks.len(), 1);
        let block = &result.constant_blocks[0];
        assert!(block.buffer_backed);
        assert_eq!(block.byte_size, 272);

        let offsets: Vec<(String, u32)> = block
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.byte_offset))
            .collect();
        assert_eq!(
            offsets,
            vec![
                ("a".into(), 0),
                ("b".into(), 16),
                ("c".into(), 80),
                ("d".into(), 128),
                ("e".into(), 144),
                ("f".into(), 192),
                ("g".into(), 256),
            ]
        );
        assert_eq!(block.variables[4].ty.array_byte_stride, 16);
        assert!(block.variables[2].ty.row_major);
        assert_eq!(block.variables[5].ty.members.len(), 3);
    }

    #[test]
    fn reflection_is_idempotent() {
        let module = uniform_block_module();
        let options = ReflectOptions::default();
        let first = reflect(&module, "main", ShaderStage::Vertex, &options).unwrap();
        let second = reflect(&module, "main", ShaderStage::Vertex, &options).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_entry_point_returns_an_empty_result() {
        let module = uniform_block_module();
        let result = reflect(
            &module,
            "not_there",
            ShaderStage::Vertex,
            &ReflectOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ReflectionResult::default());
    }

    fn spec_constant_module() -> Module {
        let mut module = Module::new(SpirvVersion::V1_0);
        base_types(&mut module);
        module.declare_constant(
            Id::new(20),
            Constant {
                ty: INT,
                value: 12,
                members: vec![],
                specialized: true,
                name: Some("foo".into()),
            },
        );
        module.decorate(Id::new(20), |d| d.spec_id = 17);
        module.declare_constant(
            Id::new(21),
            Constant {
                ty: FLOAT,
                value: u64::from(0.5f32.to_bits()),
                members: vec![],
                specialized: true,
                name: Some("bar".into()),
            },
        );
        module.decorate(Id::new(21), |d| d.spec_id = 19);
        entry(&mut module, ShaderStage::Compute, vec![]);
        module
    }

    #[test]
    fn spec_constants_occupy_8_byte_slots() {
        let module = spec_constant_module();
        let result = reflect(
            &module,
            "main",
            ShaderStage::Compute,
            &ReflectOptions::default(),
        )
        .unwrap();

        let block = result
            .constant_blocks
            .iter()
            .find(|b| b.name == "Specialization Constants")
            .unwrap();
        assert!(!block.buffer_backed);
        assert_eq!(block.byte_size, 16);
        assert_eq!(block.variables[0].name, "foo");
        assert_eq!(block.variables[0].byte_offset, 0);
        assert_eq!(block.variables[0].default_value, 12);
        assert_eq!(block.variables[0].ty.base_type, VarType::SInt);
        assert_eq!(block.variables[1].name, "bar");
        assert_eq!(block.variables[1].byte_offset, 8);
        assert_eq!(
            block.variables[1].default_value,
            u64::from(0.5f32.to_bits())
        );
    }

    #[test]
    fn specialization_overrides_replace_defaults() {
        let module = spec_constant_module();
        let options = ReflectOptions {
            specialization: vec![(19, u64::from(2.0f32.to_bits())), (99, 1)],
            ..Default::default()
        };
        let result = reflect(&module, "main", ShaderStage::Compute, &options).unwrap();
        let block = &result.constant_blocks[0];
        assert_eq!(block.variables[0].default_value, 12);
        assert_eq!(
            block.variables[1].default_value,
            u64::from(2.0f32.to_bits())
        );
    }

    #[test]
    fn local_size_id_beats_literal_local_size() {
        let mut module = Module::new(SpirvVersion::V1_3);
        base_types(&mut module);
        module.declare_constant(
            Id::new(20),
            Constant {
                ty: INT,
                value: 64,
                members: vec![],
                specialized: true,
                name: None,
            },
        );
        module.decorate(Id::new(20), |d| d.spec_id = 1);
        module.declare_constant(Id::new(21), Constant::scalar(INT, 1));
        module.declare_entry_point(EntryPoint {
            name: "main".into(),
            stage: ShaderStage::Compute,
            function: Id::new(100),
            interface: vec![],
            execution_modes: vec![
                ExecutionMode::LocalSize { x: 8, y: 8, z: 1 },
                ExecutionMode::LocalSizeId {
                    x: Id::new(20),
                    y: Id::new(21),
                    z: Id::new(21),
                },
            ],
        });

        let result = reflect(
            &module,
            "main",
            ShaderStage::Compute,
            &ReflectOptions {
                specialization: vec![(1, 128)],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.dispatch_threads_dimension, [128, 1, 1]);
    }

    #[test]
    fn depth_greater_rewrites_the_depth_output() {
        let mut module = Module::new(SpirvVersion::V1_0);
        base_types(&mut module);
        let ptr = Id::new(20);
        module.declare_type(
            ptr,
            DataType::Pointer {
                storage_class: StorageClass::Output,
                pointee: FLOAT,
            },
        );
        let var = Id::new(21);
        module.declare_variable(Variable {
            id: var,
            ty: ptr,
            storage_class: StorageClass::Output,
            name: Some("gl_FragDepth".into()),
        });
        module.decorate(var, |d| d.builtin = Some(crate::ir::Builtin::FragDepth));
        module.declare_entry_point(EntryPoint {
            name: "main".into(),
            stage: ShaderStage::Fragment,
            function: Id::new(100),
            interface: vec![var],
            execution_modes: vec![ExecutionMode::DepthGreater],
        });
        let mut function = crate::ir::Function::new(Id::new(100));
        function
            .instructions
            .push(crate::ir::FunctionInst::Store { pointer: var });
        module.declare_function(function);

        let result = reflect(
            &module,
            "main",
            ShaderStage::Fragment,
            &ReflectOptions::default(),
        )
        .unwrap();
        assert_eq!(result.output_signature.len(), 1);
        assert_eq!(
            result.output_signature[0].system_value,
            ShaderBuiltin::DepthOutputGreaterEqual
        );
    }
}
