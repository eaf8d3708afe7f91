//! Transform-feedback annotation.
//!
//! Capture-time vertex readback recompiles a module with transform
//! feedback writing every output of one raster stream into buffer 0. This
//! pass rewrites the module in place: it assigns packed byte offsets to
//! the already-flattened output signature, stamps stride and buffer
//! decorations on the touched variables, and redirects vertex emission to
//! stream 0 when a non-default raster stream was chosen.

use crate::{
    ir::{Capability, DataType, Decorations, ExecutionMode, FunctionInst, Id, Module},
    types::{ReflectionResult, ShaderBuiltin},
    ReflectError,
};
use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use tracing::warn;

/// Annotates `module` for transform-feedback capture of `raster_stream`.
///
/// `reflection` must have been produced from this same module; its output
/// signature is reordered so the position builtin comes first, matching
/// the offsets written into the module. Requires exclusive access to the
/// module: no other reflection call may run against it concurrently.
pub fn add_xfb_annotations(
    module: &mut Module,
    reflection: &mut ReflectionResult,
    raster_stream: u32,
) -> Result<(), ReflectError> {
    // owning variables in first-seen order, noting which are blocks
    let mut owners: Vec<Id> = Vec::new();
    for patch in &reflection.patch_data.outputs {
        if !owners.contains(&patch.id) {
            owners.push(patch.id);
        }
    }
    let mut blocks: HashMap<Id, (Id, usize)> = HashMap::new();
    for &id in &owners {
        let variable = module.variable(id)?;
        let pointee = module.variable_pointee(variable)?;
        if let DataType::Struct(st) = module.data_type(pointee)? {
            blocks.insert(id, (pointee, st.members.len()));
        }
    }

    // throw out any decorations that would conflict with ours
    for &id in &owners {
        module.clear_xfb_decorations(id);
        if let Some(&(struct_id, member_count)) = blocks.get(&id) {
            for member in 0..member_count {
                module.decorate_member(struct_id, member, |d| {
                    d.offset = Decorations::UNSET;
                    d.xfb_buffer = Decorations::UNSET;
                    d.xfb_stride = Decorations::UNSET;
                });
            }
        }
    }

    // readback always expects position first
    if let Some(position) = reflection
        .output_signature
        .iter()
        .position(|p| p.system_value == ShaderBuiltin::Position)
    {
        reflection.output_signature[0..=position].rotate_right(1);
        reflection.patch_data.outputs[0..=position].rotate_right(1);
    }

    let mut offset = 0u32;
    let mut touched: Vec<Id> = Vec::new();
    let mut decorated_members: HashSet<(Id, usize)> = HashSet::new();
    for (param, patch) in reflection
        .output_signature
        .iter()
        .zip(&reflection.patch_data.outputs)
    {
        if param.stream != raster_stream {
            continue;
        }
        if !touched.contains(&patch.id) {
            touched.push(patch.id);
        }

        match blocks.get(&patch.id) {
            Some(&(struct_id, _)) => {
                let member = patch.access_chain.first().copied().unwrap_or(0) as usize;
                // several slots can share a member (matrix columns); the
                // member offset is the first slot's
                if decorated_members.insert((struct_id, member)) {
                    module.decorate_member(struct_id, member, |d| d.offset = offset);
                }
            }
            None => {
                module.decorate(patch.id, |d| d.offset = offset);
            }
        }

        // components narrower than 4 bytes still occupy a full word
        let component_bytes = param.var_type.byte_size().max(4);
        offset += component_bytes * param.component_count;
    }

    let stride = offset;
    for &id in &touched {
        module.decorate(id, |d| {
            d.xfb_buffer = 0;
            d.xfb_stride = stride;
        });
    }

    if !module.has_capability(Capability::TransformFeedback) {
        module.declare_capability(Capability::TransformFeedback);
    }
    let name = reflection.entry_point.clone();
    match module.entry_point_mut(&name, reflection.stage) {
        Some(entry) => {
            if !entry.execution_modes.contains(&ExecutionMode::Xfb) {
                entry.execution_modes.push(ExecutionMode::Xfb);
            }
        }
        None => warn!(
            entry_point = name,
            "reflection does not match any entry point in the module"
        ),
    }

    // readback only observes stream 0, so the raster stream's emissions
    // move there and the rest disappear
    if raster_stream != 0 {
        for function in module.functions_mut() {
            function.instructions.retain_mut(|inst| match inst {
                FunctionInst::EmitVertex { stream } | FunctionInst::EndPrimitive { stream } => {
                    if *stream == raster_stream {
                        *stream = 0;
                        true
                    } else {
                        false
                    }
                }
                _ => true,
            });
        }
    }

    Ok(())
}
