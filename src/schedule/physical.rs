use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::schedule::buffer::{BufferId, LogicalBufferStore, PhysicalBuffer, PhysicalId};

/// Creates one physical buffer per resolved alias root
pub struct PhysicalBufferBuilder;

impl PhysicalBufferBuilder {
    /// Group buffers by root; physical ids follow ascending root id
    pub fn build(store: &mut LogicalBufferStore) -> Result<Vec<PhysicalBuffer>> {
        let mut by_root: BTreeMap<BufferId, PhysicalId> = BTreeMap::new();
        let mut physical: Vec<PhysicalBuffer> = Vec::new();

        for buffer in store.iter() {
            let root = match buffer.root {
                Some(root) => root,
                None if buffer.is_root() => buffer.id,
                None => {
                    return Err(Error::InvalidAlias(format!(
                        "{} has an alias that was never resolved",
                        buffer.name
                    )))
                }
            };
            if root != buffer.id {
                continue;
            }

            let id = PhysicalId(physical.len());
            by_root.insert(root, id);
            physical.push(PhysicalBuffer {
                id,
                location: buffer.location,
                size_bytes: 0,
                alignment: 1,
                lifetime: buffer.lifetime,
                root,
                members: Vec::new(),
                allocation: None,
            });
        }

        for buffer in store.iter_mut() {
            let root = buffer.root.unwrap_or(buffer.id);
            let id = *by_root
                .get(&root)
                .ok_or_else(|| {
                    Error::InvalidAlias(format!("{} resolves to non-root {}", buffer.name, root))
                })?;
            let group = &mut physical[id.0];

            group.size_bytes = group.size_bytes.max(buffer.size_bytes);
            group.alignment = group.alignment.max(buffer.alignment);
            group.members.push(buffer.id);
            buffer.physical = Some(id);
        }

        debug!(
            "Built {} physical buffers from {} logical buffers",
            physical.len(),
            store.len()
        );
        Ok(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, OutputId};
    use crate::schedule::buffer::{BufferAlias, Lifetime, LogicalBuffer, MemoryLocation};
    use crate::schedule::fixer::LifetimeFixer;

    #[test]
    fn test_group_takes_largest_member_and_alignment() {
        let mut store = LogicalBufferStore::new();
        for (owner, size, alignment) in [(0, 12, 4), (1, 4, 16), (2, 8, 1), (3, 6, 2)] {
            store
                .insert(LogicalBuffer {
                    id: BufferId(0),
                    owner: OutputId(owner),
                    name: format!("t{}", owner),
                    data_type: DataType::Uint8,
                    shape: vec![size],
                    parent_shape: vec![size],
                    location: MemoryLocation::Data,
                    size_bytes: size,
                    alignment,
                    lifetime: Lifetime::new(owner, 1),
                    alias: None,
                    root: None,
                    root_offset: 0,
                    physical: None,
                })
                .unwrap();
        }
        store.get_mut(BufferId(1)).unwrap().alias = Some(BufferAlias {
            parent: BufferId(0),
            offset_bytes: 0,
        });
        store.get_mut(BufferId(2)).unwrap().alias = Some(BufferAlias {
            parent: BufferId(0),
            offset_bytes: 4,
        });

        LifetimeFixer::new().run(&mut store).unwrap();
        let physical = PhysicalBufferBuilder::build(&mut store).unwrap();

        assert_eq!(physical.len(), 2);
        assert_eq!(physical[0].size_bytes, 12);
        assert_eq!(physical[0].alignment, 16);
        assert_eq!(physical[0].members, vec![BufferId(0), BufferId(1), BufferId(2)]);
        assert_eq!(physical[0].lifetime, Lifetime::new(0, 3));
        assert_eq!(physical[1].root, BufferId(3));
        assert_eq!(store.get(BufferId(2)).unwrap().physical, Some(PhysicalId(0)));
    }
}
