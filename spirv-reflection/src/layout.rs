//! Block-member layout: sizes, alignments and stride resolution.
//!
//! Three sets of alignment rules coexist for block members, and a module
//! does not say which one its producer used:
//!
//! | GLSL type | Scalar | Base   | Extended                             |
//! |-----------|--------|--------|--------------------------------------|
//! | primitive | N      | N      | N                                    |
//! | `vec2`    | N      | N * 2  | N * 2                                |
//! | `vec3`    | N      | N * 4  | N * 4                                |
//! | `vec4`    | N      | N * 4  | N * 4                                |
//! | array     | N      | N      | N, rounded up to multiple of 16      |
//! | `struct`  | max(N) | max(N) | max(N), rounded up to multiple of 16 |
//!
//! Scalar is `layout(scalar)`, base is std430, extended is std140. All
//! explicit offsets and strides normally come from decorations; when a
//! stride decoration is missing the engine computes the member's size under
//! all three models and picks the largest stride that still fits before the
//! next sibling, which is correct for whichever model the producer used.
//!
//! This module also builds the [`ShaderConstant`] member trees that
//! constant blocks, buffer resources and pointer types all share.

use crate::{
    ir::{DataType, Decorations, Id, Module, Scalar, ScalarKind, StorageClass, StructType},
    pointers::PointerTypeTable,
    types::{ShaderConstant, ShaderConstantType, VarType, UNBOUNDED_ARRAY},
    ReflectError,
};
use tracing::{error, warn};

/// Hard cap on struct/array nesting, so a hostile module cannot drive
/// unbounded recursion.
pub(crate) const MAX_NESTING_DEPTH: u32 = 64;

/// Byte size assumed for an empty struct when one shows up as an array
/// element or trailing member.
pub(crate) const EMPTY_STRUCT_SIZE: u32 = 4;

/// Alignment and size of one member under each of the three packing models.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct LayoutProps {
    pub scalar_align: u32,
    pub base_align: u32,
    pub extended_align: u32,
    pub scalar_size: u32,
    pub base_size: u32,
    pub extended_size: u32,
}

#[inline]
fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[inline]
fn align16(align: u32) -> u32 {
    align_up(align, 16).max(16)
}

/// Base-alignment multiplier for a vector of `count` components.
#[inline]
fn vector_align_multiplier(count: u32) -> u32 {
    match count {
        0 | 1 => 1,
        2 => 2,
        _ => 4,
    }
}

/// Computes the alignment and size of `constant` under all three packing
/// models. Struct sizes under the base and extended models are padded to
/// the struct's own alignment; the scalar size is not, so later siblings
/// are allowed to sit in the trailing padding.
pub(crate) fn struct_props(
    empty_struct_fallback_size: u32,
    constant: &ShaderConstant,
    depth: u32,
) -> Result<LayoutProps, ReflectError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ReflectError::NestingTooDeep);
    }

    let ty = &constant.ty;
    let mut props = if ty.base_type == VarType::Struct {
        if ty.members.is_empty() {
            LayoutProps {
                scalar_align: 1,
                base_align: 1,
                extended_align: 16,
                scalar_size: empty_struct_fallback_size,
                base_size: empty_struct_fallback_size,
                extended_size: empty_struct_fallback_size,
            }
        } else {
            let mut p = LayoutProps::default();
            let mut last_end = LayoutProps::default();
            for member in &ty.members {
                let mp = struct_props(empty_struct_fallback_size, member, depth + 1)?;
                p.scalar_align = p.scalar_align.max(mp.scalar_align);
                p.base_align = p.base_align.max(mp.base_align);
                p.extended_align = p.extended_align.max(mp.extended_align);
                last_end.scalar_size = member.byte_offset + mp.scalar_size;
                last_end.base_size = member.byte_offset + mp.base_size;
                last_end.extended_size = member.byte_offset + mp.extended_size;
            }
            p.extended_align = align16(p.extended_align);
            p.scalar_size = last_end.scalar_size;
            p.base_size = align_up(last_end.base_size, p.base_align);
            p.extended_size = align_up(last_end.extended_size, p.extended_align);
            p
        }
    } else if ty.rows > 1 && ty.columns > 1 {
        let width = ty.base_type.byte_size().max(1);
        let (vec_len, vec_count) = if ty.row_major {
            (u32::from(ty.columns), u32::from(ty.rows))
        } else {
            (u32::from(ty.rows), u32::from(ty.columns))
        };
        let base_align = width * vector_align_multiplier(vec_len);
        let (scalar_size, base_size, extended_size) = if ty.matrix_byte_stride != 0 {
            let size = ty.matrix_byte_stride * vec_count;
            (size, size, size)
        } else {
            (
                width * vec_len * vec_count,
                base_align * vec_count,
                align16(base_align) * vec_count,
            )
        };
        LayoutProps {
            scalar_align: width,
            base_align,
            extended_align: align16(base_align),
            scalar_size,
            base_size,
            extended_size,
        }
    } else {
        // scalar or vector leaf
        let width = ty.base_type.byte_size().max(1);
        let count = u32::from(ty.rows).max(1) * u32::from(ty.columns).max(1);
        let size = width * count;
        LayoutProps {
            scalar_align: width,
            base_align: width * vector_align_multiplier(count),
            extended_align: width * vector_align_multiplier(count),
            scalar_size: size,
            base_size: size,
            extended_size: size,
        }
    };

    if ty.elements != 1 {
        let elements = ty.elements.max(1);
        if ty.array_byte_stride != 0 {
            let size = ty.array_byte_stride * elements;
            props.scalar_size = size;
            props.base_size = size;
            props.extended_size = size;
        } else {
            props.extended_align = align16(props.extended_align);
            props.scalar_size = align_up(props.scalar_size, props.scalar_align) * elements;
            props.base_size = align_up(props.base_size, props.base_align) * elements;
            props.extended_size = align_up(props.extended_size, props.extended_align) * elements;
        }
    }

    Ok(props)
}

/// Picks an array stride for a member that carries no stride decoration:
/// the largest per-model stride whose array still fits in the span before
/// the next sibling (or the end of the parent). Overlap even under the
/// scalar model means the module was already malformed; the scalar stride
/// is kept so reflection can continue.
pub(crate) fn resolve_trailing_stride(
    member: &ShaderConstant,
    available_bytes: u32,
) -> Result<u32, ReflectError> {
    let mut element = member.clone();
    element.ty.elements = 1;
    element.ty.array_byte_stride = 0;
    let props = struct_props(EMPTY_STRUCT_SIZE, &element, 0)?;

    let elements = member.ty.elements.max(1);
    let scalar = align_up(props.scalar_size, props.scalar_align);
    let base = align_up(props.base_size, props.base_align);
    let extended = align_up(props.extended_size, align16(props.extended_align));

    for stride in [extended, base, scalar] {
        if let Some(total) = stride.checked_mul(elements) {
            if total <= available_bytes {
                return Ok(stride);
            }
        }
    }

    error!(
        member = member.name,
        available_bytes, scalar, "array overlaps the following member even under scalar packing",
    );
    Ok(scalar)
}

/// Propagates a matrix stride decoration down a member tree.
///
/// For multi-dimensional arrays of matrices the decoration is only attached
/// to the outermost variable, but the array elements are generated as
/// separate members; every generated node inherits the stride. Members that
/// already carry a stride of their own are left alone.
pub(crate) fn apply_matrix_byte_stride(stride: u32, ty: &mut ShaderConstantType) {
    if ty.rows > 1 && ty.columns > 1 {
        if ty.matrix_byte_stride == 0 {
            ty.matrix_byte_stride = stride;
        }
        return;
    }
    for member in &mut ty.members {
        apply_matrix_byte_stride(stride, &mut member.ty);
    }
}

/// The tight byte size of a member list: the last member's offset plus its
/// size, computed bottom-up.
pub(crate) fn minimum_byte_size(variables: &[ShaderConstant]) -> u32 {
    let Some(last) = variables.last() else {
        return 0;
    };

    let offset = last.byte_offset;

    // arrays are easy
    if last.ty.elements != 1 && last.ty.array_byte_stride > 0 {
        return offset + last.ty.array_byte_stride * last.ty.elements.max(1);
    }

    if last.ty.members.is_empty() {
        let width = last.ty.base_type.byte_size().max(1);
        let rows = u32::from(last.ty.rows).max(1);
        let cols = u32::from(last.ty.columns).max(1);

        if rows == 1 {
            offset + cols * width
        } else if cols == 1 {
            offset + rows * width
        } else if cols == 3 && last.ty.row_major {
            // 3-column row-major and 3-row column-major matrices pad the
            // short axis to 4
            offset + rows * 4 * width
        } else if rows == 3 && !last.ty.row_major {
            offset + cols * 4 * width
        } else {
            offset + rows * cols * width
        }
    } else {
        offset + minimum_byte_size(&last.ty.members)
    }
}

pub(crate) fn var_type_of(scalar: Scalar) -> VarType {
    match (scalar.kind, scalar.width) {
        (ScalarKind::Float, 16) => VarType::Half,
        (ScalarKind::Float, 64) => VarType::Double,
        (ScalarKind::Float, _) => VarType::Float,
        (ScalarKind::SInt, 8) => VarType::SByte,
        (ScalarKind::SInt, 16) => VarType::SShort,
        (ScalarKind::SInt, 64) => VarType::SLong,
        (ScalarKind::SInt, _) => VarType::SInt,
        (ScalarKind::UInt, 8) => VarType::UByte,
        (ScalarKind::UInt, 16) => VarType::UShort,
        (ScalarKind::UInt, 64) => VarType::ULong,
        (ScalarKind::UInt, _) => VarType::UInt,
    }
}

fn scalar_type_name(scalar: Scalar) -> &'static str {
    match (scalar.kind, scalar.width) {
        (ScalarKind::Float, 16) => "half",
        (ScalarKind::Float, 64) => "double",
        (ScalarKind::Float, _) => "float",
        (ScalarKind::SInt, 64) => "int64_t",
        (ScalarKind::SInt, _) => "int",
        (ScalarKind::UInt, 64) => "uint64_t",
        (ScalarKind::UInt, _) => "uint",
    }
}

fn vector_type_name(scalar: Scalar, count: u32) -> String {
    let prefix = match (scalar.kind, scalar.width) {
        (ScalarKind::Float, 16) => "f16vec",
        (ScalarKind::Float, 64) => "dvec",
        (ScalarKind::Float, _) => "vec",
        (ScalarKind::SInt, _) => "ivec",
        (ScalarKind::UInt, _) => "uvec",
    };
    format!("{}{}", prefix, count)
}

/// Builds the reflected member tree of a struct type. `span_end`, when
/// known, is the byte offset at which the parent ends; it bounds the
/// trailing-stride heuristic for the final member.
pub(crate) fn make_constant_block_variables(
    module: &Module,
    struct_type: &StructType,
    span_end: Option<u32>,
    pointers: &mut PointerTypeTable,
    depth: u32,
) -> Result<Vec<ShaderConstant>, ReflectError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ReflectError::NestingTooDeep);
    }

    let mut variables = Vec::with_capacity(struct_type.members.len());
    for (index, member) in struct_type.members.iter().enumerate() {
        let name = member
            .name
            .clone()
            .unwrap_or_else(|| format!("_child{}", index));
        variables.push(make_constant_block_variable(
            module,
            name,
            member.ty,
            member.decorations,
            pointers,
            depth + 1,
        )?);
    }

    // Members with no stride decoration get one picked from the span left
    // before their next sibling.
    for index in 0..variables.len() {
        if variables[index].ty.elements == 1 || variables[index].ty.array_byte_stride != 0 {
            continue;
        }
        let end = variables
            .get(index + 1)
            .map(|next| next.byte_offset)
            .or(span_end)
            .unwrap_or(u32::MAX);
        let available = end.saturating_sub(variables[index].byte_offset);
        let stride = resolve_trailing_stride(&variables[index], available)?;
        variables[index].ty.array_byte_stride = stride;
    }

    Ok(variables)
}

/// Builds the reflected description of one block member (or buffer/pointer
/// body, with empty decorations).
pub(crate) fn make_constant_block_variable(
    module: &Module,
    name: String,
    type_id: Id,
    decorations: Decorations,
    pointers: &mut PointerTypeTable,
    depth: u32,
) -> Result<ShaderConstant, ReflectError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(ReflectError::NestingTooDeep);
    }

    let mut out = ShaderConstant {
        name,
        byte_offset: if decorations.offset == Decorations::UNSET {
            0
        } else {
            decorations.offset
        },
        default_value: 0,
        ty: ShaderConstantType::new(),
    };
    out.ty.row_major = decorations.row_major;

    let mut leaf_id = type_id;
    if let DataType::Array {
        element_type,
        length,
    } = module.data_type(type_id)?
    {
        let elements = match module.array_length(*length)? {
            Some(n) => n as u32,
            None => UNBOUNDED_ARRAY,
        };
        let stride = if decorations.array_stride != Decorations::UNSET {
            decorations.array_stride
        } else {
            let type_dec = module.decorations(type_id);
            if type_dec.array_stride != Decorations::UNSET {
                type_dec.array_stride
            } else {
                0
            }
        };

        if let DataType::Array { .. } = module.data_type(*element_type)? {
            // Multi-dimensional array: the outer dimension is exploded into
            // one generated member per element, so that each element keeps
            // its own (inner) array description.
            let mut element_dec = decorations;
            element_dec.offset = Decorations::UNSET;
            element_dec.array_stride = Decorations::UNSET;
            let prototype = make_constant_block_variable(
                module,
                String::new(),
                *element_type,
                element_dec,
                pointers,
                depth + 1,
            )?;
            let stride = if stride != 0 {
                stride
            } else {
                resolve_trailing_stride(&prototype, u32::MAX)?
            };

            out.ty.base_type = VarType::Struct;
            out.ty.name = format!("{}[{}]", prototype.ty.name, elements);
            for index in 0..elements {
                let mut element = prototype.clone();
                element.name = format!("[{}]", index);
                element.byte_offset = index * stride;
                out.ty.members.push(element);
            }
            if decorations.matrix_stride != Decorations::UNSET {
                apply_matrix_byte_stride(decorations.matrix_stride, &mut out.ty);
            }
            return Ok(out);
        }

        out.ty.elements = elements;
        out.ty.array_byte_stride = stride;
        leaf_id = *element_type;
    }

    match module.data_type(leaf_id)? {
        DataType::Bool => {
            out.ty.base_type = VarType::Bool;
            out.ty.rows = 1;
            out.ty.columns = 1;
            out.ty.name = "bool".into();
        }
        DataType::Scalar(scalar) => {
            out.ty.base_type = var_type_of(*scalar);
            out.ty.rows = 1;
            out.ty.columns = 1;
            out.ty.name = scalar_type_name(*scalar).into();
        }
        DataType::Vector {
            scalar,
            component_count,
        } => {
            out.ty.base_type = var_type_of(*scalar);
            out.ty.rows = 1;
            out.ty.columns = *component_count as u8;
            out.ty.name = vector_type_name(*scalar, *component_count);
        }
        DataType::Matrix {
            scalar,
            rows,
            columns,
        } => {
            out.ty.base_type = var_type_of(*scalar);
            out.ty.rows = *rows as u8;
            out.ty.columns = *columns as u8;
            out.ty.name = format!("mat{}x{}", columns, rows);
            if decorations.matrix_stride != Decorations::UNSET {
                out.ty.matrix_byte_stride = decorations.matrix_stride;
            }
        }
        DataType::Struct(st) => {
            out.ty.base_type = VarType::Struct;
            out.ty.name = st.name.clone().unwrap_or_else(|| "struct".into());
            let span_end = if out.ty.elements != 1 && out.ty.array_byte_stride != 0 {
                Some(out.ty.array_byte_stride)
            } else {
                None
            };
            out.ty.members =
                make_constant_block_variables(module, st, span_end, pointers, depth + 1)?;
        }
        DataType::Pointer {
            storage_class: StorageClass::PhysicalStorageBuffer,
            pointee,
        } => {
            out.ty.base_type = VarType::GpuPointer;
            out.ty.rows = 1;
            out.ty.columns = 1;
            out.ty.name = "pointer".into();
            out.ty.pointer_type_index = Some(pointers.intern(*pointee));
        }
        other => {
            warn!(
                member = out.name,
                ?other,
                "unexpected type inside a block, reflecting it as unknown",
            );
            out.ty.base_type = VarType::Unknown;
            out.ty.rows = 1;
            out.ty.columns = 1;
        }
    }

    if decorations.matrix_stride != Decorations::UNSET {
        apply_matrix_byte_stride(decorations.matrix_stride, &mut out.ty);
    }

    Ok(out)
}
