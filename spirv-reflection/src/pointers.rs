//! The pointer type table.
//!
//! Buffer-device-address pointers can point at structs that themselves
//! contain pointers, including back at their own struct (linked lists).
//! Pointee descriptions therefore cannot be inlined into the member trees
//! that reference them; instead every distinct pointee type is interned
//! into a table, members store an index into it, and the table is resolved
//! to concrete descriptions once all references are known.

use crate::{
    ir::{Decorations, Id, Module},
    layout::make_constant_block_variable,
    types::ShaderConstantType,
    ReflectError,
};
use foldhash::HashMap;

/// Interns physical-storage-buffer pointee types in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct PointerTypeTable {
    pointees: Vec<Id>,
    index_of: HashMap<Id, u32>,
}

impl PointerTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the table index for `pointee`, registering it on first use.
    pub fn intern(&mut self, pointee: Id) -> u32 {
        if let Some(&index) = self.index_of.get(&pointee) {
            return index;
        }
        let index = self.pointees.len() as u32;
        self.pointees.push(pointee);
        self.index_of.insert(pointee, index);
        index
    }

    /// Builds the description of every interned pointee.
    ///
    /// Building a body can discover further pointees, so the table is
    /// expanded to a fixed point. Self-referencing types terminate
    /// naturally, because re-interning an id is a no-op; the pass bound
    /// only trips on a module whose type graph cannot settle, which is
    /// malformed.
    pub fn resolve(mut self, module: &Module) -> Result<Vec<ShaderConstantType>, ReflectError> {
        let mut bodies: Vec<ShaderConstantType> = Vec::new();
        let max_passes = module.type_count() + 1;
        let mut passes = 0;

        while bodies.len() < self.pointees.len() {
            passes += 1;
            if passes > max_passes {
                return Err(ReflectError::PointerCycle);
            }

            let pending = bodies.len()..self.pointees.len();
            for index in pending {
                let pointee = self.pointees[index];
                let body = make_constant_block_variable(
                    module,
                    String::new(),
                    pointee,
                    Decorations::none(),
                    &mut self,
                    0,
                )?;
                bodies.push(body.ty);
            }
        }

        Ok(bodies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ir::{DataType, Scalar, SpirvVersion, StorageClass, StructMember, StructType},
        types::VarType,
    };

    fn member(ty: Id, name: &str, offset: u32) -> StructMember {
        let mut decorations = Decorations::none();
        decorations.offset = offset;
        StructMember {
            ty,
            name: Some(name.into()),
            decorations,
        }
    }

    /// A linked-list node: `struct Node { Node* next; float value; }`.
    fn linked_list_module() -> Module {
        let mut module = Module::new(SpirvVersion::V1_3);
        module.declare_type(Id::new(1), DataType::Scalar(Scalar::F32));
        module.declare_type(
            Id::new(2),
            DataType::Pointer {
                storage_class: StorageClass::PhysicalStorageBuffer,
                pointee: Id::new(3),
            },
        );
        module.declare_type(
            Id::new(3),
            DataType::Struct(StructType {
                name: Some("Node".into()),
                members: vec![
                    member(Id::new(2), "next", 0),
                    member(Id::new(1), "value", 8),
                ],
            }),
        );
        module
    }

    #[test]
    fn self_referencing_pointee_resolves_to_one_entry() {
        let module = linked_list_module();
        let mut table = PointerTypeTable::new();
        assert_eq!(table.intern(Id::new(3)), 0);
        assert_eq!(table.intern(Id::new(3)), 0);

        let bodies = table.resolve(&module).unwrap();
        assert_eq!(bodies.len(), 1);

        let node = &bodies[0];
        assert_eq!(node.base_type, VarType::Struct);
        assert_eq!(node.name, "Node");
        assert_eq!(node.members[0].ty.base_type, VarType::GpuPointer);
        assert_eq!(node.members[0].ty.pointer_type_index, Some(0));
        assert_eq!(node.members[1].byte_offset, 8);
        assert_eq!(node.members[1].ty.base_type, VarType::Float);
    }

    #[test]
    fn chained_pointees_keep_first_seen_order() {
        let mut module = Module::new(SpirvVersion::V1_3);
        module.declare_type(Id::new(1), DataType::Scalar(Scalar::F32));
        module.declare_type(
            Id::new(2),
            DataType::Pointer {
                storage_class: StorageClass::PhysicalStorageBuffer,
                pointee: Id::new(4),
            },
        );
        // struct Outer { Inner* p; }
        module.declare_type(
            Id::new(3),
            DataType::Struct(StructType {
                name: Some("Outer".into()),
                members: vec![member(Id::new(2), "p", 0)],
            }),
        );
        // struct Inner { float value; }
        module.declare_type(
            Id::new(4),
            DataType::Struct(StructType {
                name: Some("Inner".into()),
                members: vec![member(Id::new(1), "value", 0)],
            }),
        );

        let mut table = PointerTypeTable::new();
        table.intern(Id::new(3));
        let bodies = table.resolve(&module).unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].name, "Outer");
        assert_eq!(bodies[1].name, "Inner");
        assert_eq!(bodies[0].members[0].ty.pointer_type_index, Some(1));
    }
}
