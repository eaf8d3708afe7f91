//! Static-use analysis and classification of global variables.
//!
//! Every global that is not part of the input/output interface lands in
//! one of a handful of buckets: constant block, sampler, read-only or
//! read-write resource, task payload, or the synthetic `$Globals` block
//! that collects loose non-block uniforms. Variables the entry point never
//! touches are skipped entirely.

use crate::{
    ir::{
        DataType, Decorations, Dim, EntryPoint, FunctionInst, Id, ImageType, Module, SpirvVersion,
        StorageClass, Variable,
    },
    layout::{
        make_constant_block_variable, make_constant_block_variables, minimum_byte_size,
        struct_props, var_type_of, EMPTY_STRUCT_SIZE,
    },
    pointers::PointerTypeTable,
    types::{
        ConstantBlock, ShaderConstant, ShaderConstantType, ShaderResource, ShaderSampler,
        TextureType, INVALID_BIND, UNBOUNDED_ARRAY,
    },
    ReflectError,
};
use foldhash::{HashSet, HashSetExt};
use tracing::warn;

/// Which globals (and which struct members of them) the entry point
/// statically references.
///
/// Pre-1.4 modules only list input/output variables on their entry point,
/// so usage is recovered by walking the call graph. From SPIR-V 1.4 the
/// interface list covers every storage class and is authoritative. Member
/// granularity always comes from the access-chain walk.
pub(crate) struct StaticUse {
    used: HashSet<Id>,
    /// Accessed as a whole, or through a dynamic index.
    whole: HashSet<Id>,
    members: HashSet<(Id, u32)>,
    assume_all: bool,
}

impl StaticUse {
    pub fn build(module: &Module, entry_point: &EntryPoint) -> Self {
        let mut walk_used = HashSet::new();
        let mut whole = HashSet::new();
        let mut members = HashSet::new();

        let is_global = |id: Id| module.variable(id).is_ok();

        let mut visited = HashSet::new();
        let mut pending = vec![entry_point.function];
        while let Some(function_id) = pending.pop() {
            if !visited.insert(function_id) {
                continue;
            }
            let Some(function) = module.function(function_id) else {
                continue;
            };
            for inst in &function.instructions {
                match inst {
                    FunctionInst::Load { pointer }
                    | FunctionInst::Store { pointer }
                    | FunctionInst::Atomic { pointer } => {
                        if is_global(*pointer) {
                            walk_used.insert(*pointer);
                            whole.insert(*pointer);
                        }
                    }
                    FunctionInst::AccessChain { base, indices } => {
                        if is_global(*base) {
                            walk_used.insert(*base);
                            match indices.first() {
                                Some(&index) => match module.constant_value(index) {
                                    Ok(member) => {
                                        members.insert((*base, member as u32));
                                    }
                                    // dynamic index: every member is fair game
                                    Err(_) => {
                                        whole.insert(*base);
                                    }
                                },
                                None => {
                                    whole.insert(*base);
                                }
                            }
                        }
                    }
                    FunctionInst::FunctionCall {
                        function,
                        arguments,
                    } => {
                        for &argument in arguments {
                            if is_global(argument) {
                                walk_used.insert(argument);
                                whole.insert(argument);
                            }
                        }
                        pending.push(*function);
                    }
                    FunctionInst::EmitVertex { .. } | FunctionInst::EndPrimitive { .. } => {}
                }
            }
        }

        let used = if module.version() >= SpirvVersion::V1_4 {
            entry_point.interface.iter().copied().collect()
        } else {
            walk_used
        };

        StaticUse {
            used,
            whole,
            members,
            assume_all: false,
        }
    }

    pub fn is_used(&self, id: Id) -> bool {
        self.assume_all || self.used.contains(&id)
    }

    pub fn is_member_used(&self, id: Id, member: u32) -> bool {
        self.assume_all || self.whole.contains(&id) || self.members.contains(&(id, member))
    }

    #[cfg(test)]
    pub fn all_used() -> Self {
        StaticUse {
            used: HashSet::new(),
            whole: HashSet::new(),
            members: HashSet::new(),
            assume_all: true,
        }
    }

    #[cfg(test)]
    pub fn with_members(id: Id, members: &[u32]) -> Self {
        StaticUse {
            used: std::iter::once(id).collect(),
            whole: HashSet::new(),
            members: members.iter().map(|&m| (id, m)).collect(),
            assume_all: false,
        }
    }
}

/// The classified globals of one entry point. Interface variables are
/// passed through by id for the flattener; everything else is fully built.
#[derive(Default)]
pub(crate) struct Classified {
    pub inputs: Vec<Id>,
    pub outputs: Vec<Id>,
    pub constant_blocks: Vec<ConstantBlock>,
    pub samplers: Vec<ShaderSampler>,
    pub read_only: Vec<ShaderResource>,
    pub read_write: Vec<ShaderResource>,
    pub task_payload: Option<ConstantBlock>,
}

fn resolve_binding(dec: &Decorations, bindings_from_location: bool) -> (u32, u32) {
    let set = if dec.set != Decorations::UNSET {
        dec.set
    } else {
        0
    };
    let binding = if dec.binding != Decorations::UNSET {
        dec.binding
    } else if bindings_from_location && dec.location != Decorations::UNSET {
        // GL-sourced modules carry no binding numbers; a location
        // decoration substitutes
        dec.location
    } else {
        INVALID_BIND
    };
    (set, binding)
}

fn texture_type(image: &ImageType) -> TextureType {
    match (image.dim, image.arrayed, image.multisampled) {
        (Dim::Dim1D, false, _) => TextureType::Texture1D,
        (Dim::Dim1D, true, _) => TextureType::Texture1DArray,
        (Dim::Dim2D, false, false) => TextureType::Texture2D,
        (Dim::Dim2D, true, false) => TextureType::Texture2DArray,
        (Dim::Dim2D, false, true) => TextureType::Texture2DMS,
        (Dim::Dim2D, true, true) => TextureType::Texture2DMSArray,
        (Dim::Dim3D, _, _) => TextureType::Texture3D,
        (Dim::Cube, false, _) => TextureType::TextureCube,
        (Dim::Cube, true, _) => TextureType::TextureCubeArray,
        (Dim::Rect, _, _) => TextureType::TextureRect,
        (Dim::Buffer, _, _) => TextureType::Buffer,
        (Dim::SubpassData, _, _) => TextureType::Texture2D,
    }
}

/// The texel component type of an image, as a 4-component vector.
fn sampled_type(module: &Module, image: &ImageType) -> ShaderConstantType {
    let mut ty = ShaderConstantType::new();
    ty.rows = 1;
    ty.columns = 4;
    if let Ok(DataType::Scalar(scalar)) = module.data_type(image.sampled_type) {
        ty.base_type = var_type_of(*scalar);
    }
    ty
}

struct Classifier<'a, 'p> {
    module: &'a Module,
    usage: &'a StaticUse,
    bindings_from_location: bool,
    pointers: &'p mut PointerTypeTable,
    /// Loose non-block uniforms, gathered into `$Globals` at the end.
    globals: Vec<ShaderConstant>,
    out: Classified,
}

impl Classifier<'_, '_> {
    fn variable_name(&self, variable: &Variable, prefix: &str) -> String {
        variable
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("_{}{}", prefix, variable.id.as_raw()))
    }

    fn classify(&mut self, variable: &Variable) -> Result<(), ReflectError> {
        match variable.storage_class {
            StorageClass::Private
            | StorageClass::Workgroup
            | StorageClass::CrossWorkgroup
            | StorageClass::Function
            | StorageClass::PhysicalStorageBuffer => Ok(()),
            StorageClass::Input => {
                self.out.inputs.push(variable.id);
                Ok(())
            }
            StorageClass::Output => {
                self.out.outputs.push(variable.id);
                Ok(())
            }
            StorageClass::AtomicCounter => self.classify_atomic_counter(variable),
            StorageClass::PushConstant => {
                let pointee = self.module.variable_pointee(variable)?;
                self.classify_block(variable, pointee, 1, false)
            }
            StorageClass::TaskPayloadWorkgroup => self.classify_task_payload(variable),
            StorageClass::Uniform
            | StorageClass::UniformConstant
            | StorageClass::StorageBuffer => self.classify_uniform(variable),
        }
    }

    /// Legacy GL atomic counters surface as a read-write buffer resource.
    fn classify_atomic_counter(&mut self, variable: &Variable) -> Result<(), ReflectError> {
        let dec = self.module.decorations(variable.id);
        let (set, binding) = resolve_binding(&dec, self.bindings_from_location);
        let mut ty = ShaderConstantType::new();
        ty.base_type = crate::types::VarType::UInt;
        ty.rows = 1;
        ty.columns = 1;
        ty.name = "atomic_uint".into();
        self.out.read_write.push(ShaderResource {
            name: self.variable_name(variable, "res"),
            texture_type: TextureType::Buffer,
            is_texture: false,
            is_input_attachment: false,
            fixed_bind_set_or_space: set,
            fixed_bind_number: binding,
            bind_array_size: 1,
            variable_type: ty,
        });
        Ok(())
    }

    fn classify_task_payload(&mut self, variable: &Variable) -> Result<(), ReflectError> {
        let pointee = self.module.variable_pointee(variable)?;
        let DataType::Struct(st) = self.module.data_type(pointee)? else {
            warn!(variable = %variable.id, "non-struct task payload, skipping");
            return Ok(());
        };
        let variables =
            make_constant_block_variables(self.module, st, None, self.pointers, 0)?;
        let byte_size = minimum_byte_size(&variables);
        self.out.task_payload = Some(ConstantBlock {
            name: self.variable_name(variable, "payload"),
            fixed_bind_set_or_space: 0,
            fixed_bind_number: INVALID_BIND,
            bind_array_size: 1,
            variables,
            buffer_backed: false,
            byte_size,
        });
        Ok(())
    }

    /// Builds a push-constant or uniform block. `struct_id` is the block's
    /// struct type, with any arrayed-binding dimension already unwrapped.
    fn classify_block(
        &mut self,
        variable: &Variable,
        struct_id: Id,
        bind_array_size: u32,
        buffer_backed: bool,
    ) -> Result<(), ReflectError> {
        let DataType::Struct(st) = self.module.data_type(struct_id)? else {
            warn!(variable = %variable.id, "non-struct block variable, skipping");
            return Ok(());
        };
        let dec = self.module.decorations(variable.id);
        let (set, binding) = if buffer_backed {
            resolve_binding(&dec, self.bindings_from_location)
        } else {
            (0, INVALID_BIND)
        };
        let name = variable
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| st.name.clone())
            .unwrap_or_else(|| format!("_uniforms{}", variable.id.as_raw()));

        let variables =
            make_constant_block_variables(self.module, st, None, self.pointers, 0)?;
        let byte_size = minimum_byte_size(&variables);
        self.out.constant_blocks.push(ConstantBlock {
            name,
            fixed_bind_set_or_space: set,
            fixed_bind_number: binding,
            bind_array_size,
            variables,
            buffer_backed,
            byte_size,
        });
        Ok(())
    }

    fn classify_uniform(&mut self, variable: &Variable) -> Result<(), ReflectError> {
        let mut pointee = self.module.variable_pointee(variable)?;

        // an arrayed binding: unwrap to the element type
        let mut bind_array_size = 1;
        if let DataType::Array {
            element_type,
            length,
        } = self.module.data_type(pointee)?
        {
            bind_array_size = match self.module.array_length(*length)? {
                Some(count) => count as u32,
                None => UNBOUNDED_ARRAY,
            };
            pointee = *element_type;
        }

        let dec = self.module.decorations(variable.id);
        let (set, binding) = resolve_binding(&dec, self.bindings_from_location);

        match self.module.data_type(pointee)? {
            DataType::Sampler => {
                self.out.samplers.push(ShaderSampler {
                    name: self.variable_name(variable, "res"),
                    fixed_bind_set_or_space: set,
                    fixed_bind_number: binding,
                    bind_array_size,
                });
                Ok(())
            }
            DataType::Image(image) => {
                let resource = ShaderResource {
                    name: self.variable_name(variable, "res"),
                    texture_type: texture_type(image),
                    is_texture: image.sampled == 1 && image.dim != Dim::Buffer,
                    is_input_attachment: image.dim == Dim::SubpassData,
                    fixed_bind_set_or_space: set,
                    fixed_bind_number: binding,
                    bind_array_size,
                    variable_type: sampled_type(self.module, image),
                };
                if image.sampled == 2 {
                    self.out.read_write.push(resource);
                } else {
                    self.out.read_only.push(resource);
                }
                Ok(())
            }
            DataType::SampledImage { image_type } => {
                let DataType::Image(image) = self.module.data_type(*image_type)? else {
                    return Err(ReflectError::UnknownId(*image_type));
                };
                self.out.read_only.push(ShaderResource {
                    name: self.variable_name(variable, "res"),
                    texture_type: texture_type(image),
                    is_texture: true,
                    is_input_attachment: false,
                    fixed_bind_set_or_space: set,
                    fixed_bind_number: binding,
                    bind_array_size,
                    variable_type: sampled_type(self.module, image),
                });
                Ok(())
            }
            DataType::AccelerationStructure | DataType::RayQuery => {
                self.out.read_only.push(ShaderResource {
                    name: self.variable_name(variable, "res"),
                    texture_type: TextureType::Unknown,
                    is_texture: false,
                    is_input_attachment: false,
                    fixed_bind_set_or_space: set,
                    fixed_bind_number: binding,
                    bind_array_size,
                    variable_type: ShaderConstantType::new(),
                });
                Ok(())
            }
            DataType::Struct(st) => {
                let type_dec = self.module.decorations(pointee);
                let storage_buffer = variable.storage_class == StorageClass::StorageBuffer
                    || type_dec.buffer_block;
                if storage_buffer {
                    let variables =
                        make_constant_block_variables(self.module, st, None, self.pointers, 0)?;
                    let mut variable_type = ShaderConstantType::new();
                    variable_type.base_type = crate::types::VarType::Struct;
                    variable_type.name = st
                        .name
                        .clone()
                        .unwrap_or_else(|| "struct".into());
                    variable_type.members = variables;
                    self.out.read_write.push(ShaderResource {
                        name: self.variable_name(variable, "res"),
                        texture_type: TextureType::Buffer,
                        is_texture: false,
                        is_input_attachment: false,
                        fixed_bind_set_or_space: set,
                        fixed_bind_number: binding,
                        bind_array_size,
                        variable_type,
                    });
                    Ok(())
                } else {
                    self.classify_block(variable, pointee, bind_array_size, true)
                }
            }
            // a loose non-block uniform: legacy GL flat uniforms
            DataType::Bool
            | DataType::Scalar(_)
            | DataType::Vector { .. }
            | DataType::Matrix { .. } => {
                let name = self.variable_name(variable, "uniforms");
                let member = make_constant_block_variable(
                    self.module,
                    name,
                    pointee,
                    dec,
                    self.pointers,
                    0,
                )?;
                self.globals.push(member);
                Ok(())
            }
            other => {
                warn!(variable = %variable.id, ?other, "unhandled uniform type, skipping");
                Ok(())
            }
        }
    }

    /// Packs the gathered loose uniforms into `$Globals` with base-layout
    /// offsets in appearance order.
    fn finish_globals(&mut self) -> Result<(), ReflectError> {
        if self.globals.is_empty() {
            return Ok(());
        }
        let mut cursor = 0u32;
        for member in &mut self.globals {
            let props = struct_props(EMPTY_STRUCT_SIZE, member, 0)?;
            member.byte_offset = cursor.div_ceil(props.base_align) * props.base_align;
            cursor = member.byte_offset + props.base_size;
        }
        let variables = std::mem::take(&mut self.globals);
        let byte_size = minimum_byte_size(&variables);
        self.out.constant_blocks.push(ConstantBlock {
            name: "$Globals".into(),
            fixed_bind_set_or_space: 0,
            fixed_bind_number: INVALID_BIND,
            bind_array_size: 1,
            variables,
            buffer_backed: false,
            byte_size,
        });
        Ok(())
    }
}

/// Buckets every statically-used global of the module.
pub(crate) fn classify_globals(
    module: &Module,
    usage: &StaticUse,
    bindings_from_location: bool,
    pointers: &mut PointerTypeTable,
) -> Result<Classified, ReflectError> {
    let mut classifier = Classifier {
        module,
        usage,
        bindings_from_location,
        pointers,
        globals: Vec::new(),
        out: Classified::default(),
    };

    for variable in module.global_variables() {
        if !classifier.usage.is_used(variable.id) {
            continue;
        }
        classifier.classify(variable)?;
    }
    classifier.finish_globals()?;
    Ok(classifier.out)
}

/// Final ordering pass: every list sorts by `(set, binding)` with
/// unresolved bindings last (the sentinel is all-ones, so the natural
/// order already does this), unresolved bindings are renumbered to 0, and
/// block members sort by byte offset. Constant blocks additionally order
/// descriptor-backed before non-descriptor ones.
pub(crate) fn finalize_bindings(classified: &mut Classified) {
    fn renumber(binding: &mut u32) {
        if *binding == INVALID_BIND {
            *binding = 0;
        }
    }

    // blocks with no descriptor binding (push constants, specialization
    // constants, $Globals) always come after the descriptor-backed ones
    classified
        .constant_blocks
        .sort_by_key(|b| (!b.buffer_backed, b.fixed_bind_set_or_space, b.fixed_bind_number));
    classified
        .samplers
        .sort_by_key(|s| (s.fixed_bind_set_or_space, s.fixed_bind_number));
    classified
        .read_only
        .sort_by_key(|r| (r.fixed_bind_set_or_space, r.fixed_bind_number));
    classified
        .read_write
        .sort_by_key(|r| (r.fixed_bind_set_or_space, r.fixed_bind_number));

    for block in &mut classified.constant_blocks {
        renumber(&mut block.fixed_bind_number);
        block.variables.sort_by_key(|v| v.byte_offset);
    }
    for sampler in &mut classified.samplers {
        renumber(&mut sampler.fixed_bind_number);
    }
    for resource in classified
        .read_only
        .iter_mut()
        .chain(classified.read_write.iter_mut())
    {
        renumber(&mut resource.fixed_bind_number);
    }
    if let Some(payload) = &mut classified.task_payload {
        payload.variables.sort_by_key(|v| v.byte_offset);
    }
}
