//! Flattening of input/output interface variables into signature slots.
//!
//! A single interface variable can be an arbitrarily nested tree of
//! structs, arrays and matrices. Hardware-style signatures are flat, so
//! the tree is walked depth-first and every leaf vector becomes one
//! [`SigParameter`], with a parallel [`InterfacePatch`] record storing the
//! access chain that reaches the leaf from the owning variable.

use crate::{
    ir::{Builtin, DataType, Decorations, Id, Module, Scalar, Variable},
    layout::var_type_of,
    resources::StaticUse,
    types::{InterfacePatch, ShaderBuiltin, ShaderStage, SigParameter, VarType},
    ReflectError,
};
use smallvec::SmallVec;
use tracing::warn;

// the interface walk shares the layout engine's nesting bound
use crate::layout::MAX_NESTING_DEPTH;

/// Stages where the outermost array dimension of an interface variable is
/// the vertex/invocation index rather than a real array: it is stripped
/// instead of being expanded into `[i]` slots.
fn strips_outer_array(stage: ShaderStage, is_input: bool) -> bool {
    match stage {
        ShaderStage::Geometry | ShaderStage::TessellationEvaluation => is_input,
        ShaderStage::TessellationControl => true,
        ShaderStage::Mesh => !is_input,
        _ => false,
    }
}

/// Builtins that only exist to satisfy interface matching; a slot for one
/// is emitted only when the shader actually reads or writes it.
fn is_strippable(builtin: Builtin, per_primitive: bool) -> bool {
    matches!(
        builtin,
        Builtin::PointSize | Builtin::ClipDistance | Builtin::CullDistance
    ) || (per_primitive
        && matches!(
            builtin,
            Builtin::PrimitiveId
                | Builtin::Layer
                | Builtin::ViewportIndex
                | Builtin::CullPrimitive
                | Builtin::PrimitiveShadingRate
        ))
}

/// Maps a builtin decoration onto a signature system value. A few builtins
/// mean different things per stage, so the stage is part of the mapping.
pub(crate) fn builtin_to_system_value(builtin: Builtin, stage: ShaderStage) -> ShaderBuiltin {
    match builtin {
        Builtin::Position | Builtin::FragCoord => ShaderBuiltin::Position,
        Builtin::PointSize => ShaderBuiltin::PointSize,
        Builtin::ClipDistance => ShaderBuiltin::ClipDistance,
        Builtin::CullDistance => ShaderBuiltin::CullDistance,
        Builtin::VertexIndex => ShaderBuiltin::VertexIndex,
        Builtin::InstanceIndex => ShaderBuiltin::InstanceIndex,
        Builtin::PrimitiveId => ShaderBuiltin::PrimitiveIndex,
        Builtin::InvocationId => match stage {
            ShaderStage::TessellationControl => ShaderBuiltin::OutputControlPointIndex,
            _ => ShaderBuiltin::GsInstanceIndex,
        },
        Builtin::Layer => ShaderBuiltin::RtIndex,
        Builtin::ViewportIndex => ShaderBuiltin::ViewportIndex,
        Builtin::TessLevelOuter => ShaderBuiltin::OuterTessFactor,
        Builtin::TessLevelInner => ShaderBuiltin::InsideTessFactor,
        Builtin::PatchVertices => ShaderBuiltin::PatchNumVertices,
        Builtin::FrontFacing => ShaderBuiltin::IsFrontFace,
        Builtin::SampleId => ShaderBuiltin::MsaaSampleIndex,
        Builtin::SamplePosition => ShaderBuiltin::MsaaSamplePosition,
        Builtin::SampleMask => ShaderBuiltin::MsaaCoverage,
        Builtin::FragDepth => ShaderBuiltin::DepthOutput,
        Builtin::GlobalInvocationId => ShaderBuiltin::DispatchThreadIndex,
        Builtin::LocalInvocationId => ShaderBuiltin::GroupThreadIndex,
        Builtin::LocalInvocationIndex => ShaderBuiltin::GroupFlatIndex,
        Builtin::WorkgroupId => ShaderBuiltin::GroupIndex,
        Builtin::NumWorkgroups => ShaderBuiltin::GroupCount,
        Builtin::CullPrimitive => ShaderBuiltin::CullPrimitiveOutput,
        Builtin::PrimitiveShadingRate => ShaderBuiltin::ShadingRateOutput,
        Builtin::WorkgroupSize => {
            warn!("WorkgroupSize decoration on an interface variable");
            ShaderBuiltin::Undefined
        }
    }
}

/// Source-style display name for an exploded builtin-block member.
fn builtin_name(builtin: Builtin) -> &'static str {
    match builtin {
        Builtin::Position => "gl_Position",
        Builtin::PointSize => "gl_PointSize",
        Builtin::ClipDistance => "gl_ClipDistance",
        Builtin::CullDistance => "gl_CullDistance",
        Builtin::VertexIndex => "gl_VertexIndex",
        Builtin::InstanceIndex => "gl_InstanceIndex",
        Builtin::PrimitiveId => "gl_PrimitiveID",
        Builtin::InvocationId => "gl_InvocationID",
        Builtin::Layer => "gl_Layer",
        Builtin::ViewportIndex => "gl_ViewportIndex",
        Builtin::TessLevelOuter => "gl_TessLevelOuter",
        Builtin::TessLevelInner => "gl_TessLevelInner",
        Builtin::PatchVertices => "gl_PatchVerticesIn",
        Builtin::FragCoord => "gl_FragCoord",
        Builtin::FrontFacing => "gl_FrontFacing",
        Builtin::SampleId => "gl_SampleID",
        Builtin::SamplePosition => "gl_SamplePosition",
        Builtin::SampleMask => "gl_SampleMask",
        Builtin::FragDepth => "gl_FragDepth",
        Builtin::WorkgroupSize => "gl_WorkGroupSize",
        Builtin::GlobalInvocationId => "gl_GlobalInvocationID",
        Builtin::LocalInvocationId => "gl_LocalInvocationID",
        Builtin::LocalInvocationIndex => "gl_LocalInvocationIndex",
        Builtin::WorkgroupId => "gl_WorkGroupID",
        Builtin::NumWorkgroups => "gl_NumWorkGroups",
        Builtin::CullPrimitive => "gl_CullPrimitiveEXT",
        Builtin::PrimitiveShadingRate => "gl_PrimitiveShadingRateEXT",
    }
}

struct SigWalker<'a> {
    module: &'a Module,
    stage: ShaderStage,
    is_input: bool,
    usage: &'a StaticUse,
    owner: Id,
    /// Register cursor: slots without a location decoration continue from
    /// the previous sibling.
    next_reg: u32,
    params: Vec<SigParameter>,
    patches: Vec<InterfacePatch>,
}

impl SigWalker<'_> {
    fn walk(
        &mut self,
        type_id: Id,
        name: &str,
        dec: Decorations,
        chain: &mut SmallVec<[u32; 4]>,
        strip_outer: bool,
        depth: u32,
    ) -> Result<(), ReflectError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ReflectError::NestingTooDeep);
        }

        if dec.location != Decorations::UNSET && dec.builtin.is_none() {
            self.next_reg = dec.location;
        }

        match self.module.data_type(type_id)? {
            DataType::Array {
                element_type,
                length,
            } => {
                if strip_outer {
                    return self.walk(*element_type, name, dec, chain, false, depth + 1);
                }
                let Some(count) = self.module.array_length(*length)? else {
                    warn!(name, "runtime-sized interface array, reflecting one element");
                    chain.push(0);
                    let result =
                        self.walk(*element_type, &format!("{}[0]", name), dec, chain, false, depth + 1);
                    chain.pop();
                    return result;
                };
                let mut element_dec = dec;
                for index in 0..count as u32 {
                    chain.push(index);
                    self.walk(
                        *element_type,
                        &format!("{}[{}]", name, index),
                        element_dec,
                        chain,
                        false,
                        depth + 1,
                    )?;
                    chain.pop();
                    // later elements continue from the cursor
                    element_dec.location = Decorations::UNSET;
                }
                Ok(())
            }
            DataType::Struct(st) => {
                let is_builtin_block = st
                    .members
                    .iter()
                    .any(|member| member.decorations.builtin.is_some());

                for (index, member) in st.members.iter().enumerate() {
                    let mut member_dec = member.decorations;
                    if member_dec.builtin.is_none() {
                        member_dec.builtin = dec.builtin;
                    }
                    member_dec.stream = dec.stream;
                    member_dec.per_primitive |= dec.per_primitive;

                    if is_builtin_block {
                        if let Some(builtin) = member_dec.builtin {
                            if is_strippable(builtin, member_dec.per_primitive)
                                && !self.usage.is_member_used(self.owner, index as u32)
                            {
                                continue;
                            }
                        }
                    }

                    let member_name = match (&member.name, member_dec.builtin) {
                        (Some(name), _) => name.clone(),
                        (None, Some(builtin)) if is_builtin_block => builtin_name(builtin).into(),
                        (None, _) => format!("{}._member{}", name, index),
                    };
                    let child_name = if is_builtin_block || member.name.is_none() {
                        member_name
                    } else {
                        format!("{}.{}", name, member_name)
                    };

                    chain.push(index as u32);
                    self.walk(member.ty, &child_name, member_dec, chain, false, depth + 1)?;
                    chain.pop();
                }
                Ok(())
            }
            DataType::Bool => {
                self.emit(name, VarType::Bool, 1, dec, chain);
                Ok(())
            }
            DataType::Scalar(scalar) => {
                self.emit(name, var_type_of(*scalar), 1, dec, chain);
                Ok(())
            }
            DataType::Vector {
                scalar,
                component_count,
            } => {
                self.emit(name, var_type_of(*scalar), *component_count, dec, chain);
                Ok(())
            }
            DataType::Matrix {
                scalar,
                rows,
                columns,
            } => {
                self.emit_matrix(name, *scalar, *rows, *columns, dec, chain);
                Ok(())
            }
            other => {
                warn!(name, ?other, "unexpected type in a shader interface, skipping");
                Ok(())
            }
        }
    }

    fn emit_matrix(
        &mut self,
        name: &str,
        scalar: Scalar,
        rows: u32,
        columns: u32,
        dec: Decorations,
        chain: &mut SmallVec<[u32; 4]>,
    ) {
        let (axis, vec_len, vec_count) = if dec.row_major {
            ("row", columns, rows)
        } else {
            ("col", rows, columns)
        };
        for index in 0..vec_count {
            chain.push(index);
            self.emit(
                &format!("{}:{}{}", name, axis, index),
                var_type_of(scalar),
                vec_len,
                dec,
                chain,
            );
            chain.pop();
        }
    }

    fn emit(
        &mut self,
        name: &str,
        var_type: VarType,
        component_count: u32,
        dec: Decorations,
        chain: &SmallVec<[u32; 4]>,
    ) {
        let system_value = match dec.builtin {
            Some(builtin) => builtin_to_system_value(builtin, self.stage),
            None if !self.is_input && self.stage == ShaderStage::Fragment => {
                ShaderBuiltin::ColorOutput
            }
            None => ShaderBuiltin::Undefined,
        };

        // builtins do not occupy user locations
        let pinned = dec.builtin.is_some();
        let reg_index = if pinned { 0 } else { self.next_reg };
        let reg_step = if var_type.byte_size() == 8 { 2 } else { 1 };
        if !pinned {
            self.next_reg = reg_index + reg_step;
        }

        let mask = (((1u32 << component_count.min(8)) - 1) << dec.component) as u8;

        self.params.push(SigParameter {
            var_name: name.into(),
            reg_index,
            system_value,
            var_type,
            component_count,
            reg_channel_mask: mask,
            channel_used_mask: mask,
            stream: dec.stream,
            per_primitive: dec.per_primitive,
        });
        self.patches.push(InterfacePatch {
            id: self.owner,
            access_chain: chain.clone(),
        });
    }
}

/// Flattens one interface variable into signature slots plus parallel
/// patch records. Slots are emitted in declaration order; the caller sorts
/// the merged list with [`sort_signature`] once all variables are in.
pub(crate) fn flatten_signature(
    module: &Module,
    variable: &Variable,
    stage: ShaderStage,
    is_input: bool,
    usage: &StaticUse,
) -> Result<(Vec<SigParameter>, Vec<InterfacePatch>), ReflectError> {
    let pointee = module.variable_pointee(variable)?;
    let dec = module.decorations(variable.id);
    let name = variable
        .name
        .clone()
        .unwrap_or_else(|| format!("_sig{}", variable.id.as_raw()));

    let mut walker = SigWalker {
        module,
        stage,
        is_input,
        usage,
        owner: variable.id,
        next_reg: 0,
        params: Vec::new(),
        patches: Vec::new(),
    };
    let mut chain = SmallVec::new();
    let strip = strips_outer_array(stage, is_input);
    walker.walk(pointee, &name, dec, &mut chain, strip, 0)?;
    Ok((walker.params, walker.patches))
}

/// Sorts a signature into its final order, keeping the patch records
/// parallel: system-value slots first, then by system value, register,
/// channel mask and name. The sort is stable so equal slots keep their
/// declaration order.
pub(crate) fn sort_signature(params: &mut Vec<SigParameter>, patches: &mut Vec<InterfacePatch>) {
    debug_assert_eq!(params.len(), patches.len());

    let mut order: Vec<usize> = (0..params.len()).collect();
    order.sort_by(|&a, &b| {
        let pa = &params[a];
        let pb = &params[b];
        (pa.system_value == ShaderBuiltin::Undefined)
            .cmp(&(pb.system_value == ShaderBuiltin::Undefined))
            .then_with(|| pa.system_value.cmp(&pb.system_value))
            .then_with(|| pa.reg_index.cmp(&pb.reg_index))
            .then_with(|| pa.reg_channel_mask.cmp(&pb.reg_channel_mask))
            .then_with(|| pa.var_name.cmp(&pb.var_name))
            .then_with(|| a.cmp(&b))
    });

    *params = order.iter().map(|&i| params[i].clone()).collect();
    *patches = order.iter().map(|&i| patches[i].clone()).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{
        ArrayLength, Constant, SpirvVersion, StorageClass, StructMember, StructType,
    };

    const F32: Id = Id::new(1);
    const VEC4: Id = Id::new(2);
    const PTR_IN_VEC4: Id = Id::new(3);
    const MAT4: Id = Id::new(4);
    const PTR_OUT_MAT4: Id = Id::new(5);

    fn test_module() -> Module {
        let mut module = Module::new(SpirvVersion::V1_0);
        module.declare_type(F32, DataType::Scalar(Scalar::F32));
        module.declare_type(
            VEC4,
            DataType::Vector {
                scalar: Scalar::F32,
                component_count: 4,
            },
        );
        module.declare_type(
            PTR_IN_VEC4,
            DataType::Pointer {
                storage_class: StorageClass::Input,
                pointee: VEC4,
            },
        );
        module.declare_type(
            MAT4,
            DataType::Matrix {
                scalar: Scalar::F32,
                rows: 4,
                columns: 4,
            },
        );
        module.declare_type(
            PTR_OUT_MAT4,
            DataType::Pointer {
                storage_class: StorageClass::Output,
                pointee: MAT4,
            },
        );
        module
    }

    fn variable(id: u32, ty: Id, storage_class: StorageClass, name: &str) -> Variable {
        Variable {
            id: Id::new(id),
            ty,
            storage_class,
            name: Some(name.into()),
        }
    }

    #[test]
    fn vector_input_lands_on_its_location() {
        let mut module = test_module();
        let var = variable(10, PTR_IN_VEC4, StorageClass::Input, "uv");
        module.decorate(var.id, |d| d.location = 3);
        module.declare_variable(var.clone());

        let usage = StaticUse::all_used();
        let (params, patches) =
            flatten_signature(&module, &var, ShaderStage::Vertex, true, &usage).unwrap();

        assert_eq!(params.len(), 1);
        assert_eq!(params[0].var_name, "uv");
        assert_eq!(params[0].reg_index, 3);
        assert_eq!(params[0].var_type, VarType::Float);
        assert_eq!(params[0].component_count, 4);
        assert_eq!(params[0].reg_channel_mask, 0xf);
        assert_eq!(patches[0].id, var.id);
        assert!(patches[0].access_chain.is_empty());
    }

    #[test]
    fn matrix_output_emits_one_slot_per_column() {
        let mut module = test_module();
        let var = variable(11, PTR_OUT_MAT4, StorageClass::Output, "m");
        module.decorate(var.id, |d| d.location = 2);
        module.declare_variable(var.clone());

        let usage = StaticUse::all_used();
        let (params, patches) =
            flatten_signature(&module, &var, ShaderStage::Vertex, false, &usage).unwrap();

        assert_eq!(params.len(), 4);
        for (i, param) in params.iter().enumerate() {
            assert_eq!(param.var_name, format!("m:col{}", i));
            assert_eq!(param.reg_index, 2 + i as u32);
            assert_eq!(param.component_count, 4);
            assert_eq!(patches[i].access_chain.as_slice(), &[i as u32]);
        }
    }

    #[test]
    fn builtin_block_is_exploded_and_unused_members_stripped() {
        let mut module = test_module();
        let mut position_dec = Decorations::none();
        position_dec.builtin = Some(Builtin::Position);
        let mut point_size_dec = Decorations::none();
        point_size_dec.builtin = Some(Builtin::PointSize);

        let block = Id::new(20);
        module.declare_type(
            block,
            DataType::Struct(StructType {
                name: Some("gl_PerVertex".into()),
                members: vec![
                    StructMember {
                        ty: VEC4,
                        name: None,
                        decorations: position_dec,
                    },
                    StructMember {
                        ty: F32,
                        name: None,
                        decorations: point_size_dec,
                    },
                ],
            }),
        );
        let ptr = Id::new(21);
        module.declare_type(
            ptr,
            DataType::Pointer {
                storage_class: StorageClass::Output,
                pointee: block,
            },
        );
        let var = Variable {
            id: Id::new(22),
            ty: ptr,
            storage_class: StorageClass::Output,
            name: None,
        };
        module.declare_variable(var.clone());

        // only member 0 (position) is written
        let usage = StaticUse::with_members(var.id, &[0]);
        let (params, _) =
            flatten_signature(&module, &var, ShaderStage::Vertex, false, &usage).unwrap();

        assert_eq!(params.len(), 1);
        assert_eq!(params[0].var_name, "gl_Position");
        assert_eq!(params[0].system_value, ShaderBuiltin::Position);
        assert_eq!(params[0].reg_index, 0);
    }

    #[test]
    fn geometry_inputs_strip_the_outer_array() {
        let mut module = test_module();
        let three = Id::new(30);
        module.declare_constant(three, Constant::scalar(F32, 3));
        let array = Id::new(32);
        module.declare_type(
            array,
            DataType::Array {
                element_type: VEC4,
                length: ArrayLength::Constant(three),
            },
        );
        let ptr = Id::new(33);
        module.declare_type(
            ptr,
            DataType::Pointer {
                storage_class: StorageClass::Input,
                pointee: array,
            },
        );
        let var = variable(34, ptr, StorageClass::Input, "color");
        module.decorate(var.id, |d| d.location = 0);
        module.declare_variable(var.clone());

        let usage = StaticUse::all_used();
        let (params, _) =
            flatten_signature(&module, &var, ShaderStage::Geometry, true, &usage).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].var_name, "color");

        // the same variable in a vertex shader expands fully
        let (params, _) =
            flatten_signature(&module, &var, ShaderStage::Vertex, true, &usage).unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].var_name, "color[0]");
        assert_eq!(params[2].reg_index, 2);
    }

    #[test]
    fn emitted_reg_indices_are_non_decreasing() {
        let mut module = test_module();
        let st = Id::new(40);
        module.declare_type(
            st,
            DataType::Struct(StructType {
                name: Some("S".into()),
                members: vec![
                    StructMember {
                        ty: VEC4,
                        name: Some("a".into()),
                        decorations: Decorations::none(),
                    },
                    StructMember {
                        ty: MAT4,
                        name: Some("b".into()),
                        decorations: Decorations::none(),
                    },
                    StructMember {
                        ty: F32,
                        name: Some("c".into()),
                        decorations: Decorations::none(),
                    },
                ],
            }),
        );
        let ptr = Id::new(41);
        module.declare_type(
            ptr,
            DataType::Pointer {
                storage_class: StorageClass::Output,
                pointee: st,
            },
        );
        let var = variable(42, ptr, StorageClass::Output, "s");
        module.decorate(var.id, |d| d.location = 1);
        module.declare_variable(var.clone());

        let usage = StaticUse::all_used();
        let (params, _) =
            flatten_signature(&module, &var, ShaderStage::Vertex, false, &usage).unwrap();

        assert_eq!(params.len(), 6);
        assert!(params
            .windows(2)
            .all(|w| w[0].reg_index <= w[1].reg_index));
        assert_eq!(params[0].reg_index, 1);
        assert_eq!(params[5].var_name, "s.c");
        assert_eq!(params[5].reg_index, 6);
    }

    #[test]
    fn signature_sort_puts_system_values_first() {
        let mut params = vec![
            SigParameter {
                var_name: "user".into(),
                reg_index: 0,
                ..Default::default()
            },
            SigParameter {
                var_name: "gl_Position".into(),
                system_value: ShaderBuiltin::Position,
                ..Default::default()
            },
            SigParameter {
                var_name: "user2".into(),
                reg_index: 1,
                ..Default::default()
            },
        ];
        let mut patches = vec![
            InterfacePatch {
                id: Id::new(1),
                ..Default::default()
            },
            InterfacePatch {
                id: Id::new(2),
                ..Default::default()
            },
            InterfacePatch {
                id: Id::new(3),
                ..Default::default()
            },
        ];

        sort_signature(&mut params, &mut patches);
        assert_eq!(params[0].var_name, "gl_Position");
        assert_eq!(params[1].var_name, "user");
        assert_eq!(params[2].var_name, "user2");
        // patch records follow their parameters
        assert_eq!(patches[0].id, Id::new(2));
        assert_eq!(patches[1].id, Id::new(1));
    }
}
