use std::collections::{BTreeMap, HashSet};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::schedule::buffer::{BufferId, Lifetime, LogicalBufferStore};

/// Summary of one fixer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixStats {
    /// Number of alias groups, singletons included
    pub groups: usize,
    /// Number of buffers that resolved to a root other than themselves
    pub aliased: usize,
}

/// Resolves alias chains to their terminal root and widens root lifetimes
///
/// Resolution is a union-find `find` with path compression: every buffer ends
/// up pointing straight at its root together with the summed offset of the
/// chain. A chain that revisits a buffer is rejected.
pub struct LifetimeFixer {
    /// Resolved (root, offset) per buffer id
    resolved: Vec<Option<(BufferId, usize)>>,
}

impl LifetimeFixer {
    pub fn new() -> Self {
        Self { resolved: Vec::new() }
    }

    /// Resolve every buffer in the store and widen root lifetimes
    pub fn run(mut self, store: &mut LogicalBufferStore) -> Result<FixStats> {
        self.resolved = vec![None; store.len()];

        for index in 0..store.len() {
            self.find_root(store, BufferId(index))?;
        }

        let mut groups: BTreeMap<BufferId, Lifetime> = BTreeMap::new();
        let mut aliased = 0;

        for index in 0..store.len() {
            let id = BufferId(index);
            let (root, offset) = self.resolved[index]
                .ok_or_else(|| Error::InvalidAlias(format!("{} was not resolved", id)))?;

            let root_buffer = store.get(root)?;
            let root_size = root_buffer.size_bytes;
            let root_location = root_buffer.location;

            let buffer = store.get_mut(id)?;
            let end = offset.checked_add(buffer.size_bytes).ok_or_else(|| {
                Error::InvalidAlias(format!("Offset of {} overflows", buffer.name))
            })?;
            if end > root_size {
                return Err(Error::InvalidAlias(format!(
                    "{} spans bytes {}..{} of root {} with only {} bytes",
                    buffer.name, offset, end, root, root_size
                )));
            }

            buffer.root = Some(root);
            buffer.root_offset = offset;
            buffer.location = root_location;
            if root != id {
                aliased += 1;
            }

            groups
                .entry(root)
                .and_modify(|lifetime| *lifetime = lifetime.union(&buffer.lifetime))
                .or_insert(buffer.lifetime);
        }

        for (&root, &lifetime) in &groups {
            let buffer = store.get_mut(root)?;
            if buffer.lifetime != lifetime {
                trace!(
                    "widen {} from [{}, {}) to [{}, {})",
                    root,
                    buffer.lifetime.birth,
                    buffer.lifetime.end(),
                    lifetime.birth,
                    lifetime.end()
                );
            }
            buffer.lifetime = lifetime;
        }

        let stats = FixStats {
            groups: groups.len(),
            aliased,
        };
        debug!(
            "Lifetime fixer: {} groups, {} aliased buffers",
            stats.groups, stats.aliased
        );
        Ok(stats)
    }

    /// Find the root of `id`, compressing the visited path
    fn find_root(&mut self, store: &LogicalBufferStore, id: BufferId) -> Result<(BufferId, usize)> {
        let mut path: Vec<(BufferId, usize)> = Vec::new();
        let mut on_path = HashSet::new();
        let mut current = id;

        let (root, mut offset) = loop {
            if let Some(resolved) = self.resolved[current.0] {
                break resolved;
            }
            if !on_path.insert(current) {
                return Err(Error::AliasCycle(current.to_string()));
            }
            match store.get(current)?.alias {
                Some(alias) => {
                    path.push((current, alias.offset_bytes));
                    current = alias.parent;
                }
                None => {
                    self.resolved[current.0] = Some((current, 0));
                    break (current, 0);
                }
            }
        };

        // Walk back from the root so each member sees the sum of the offsets above it
        for &(member, edge) in path.iter().rev() {
            offset = offset
                .checked_add(edge)
                .ok_or_else(|| {
                    Error::InvalidAlias(format!("Offset chain of {} overflows", member))
                })?;
            self.resolved[member.0] = Some((root, offset));
        }

        self.resolved[id.0].ok_or_else(|| Error::AliasCycle(id.to_string()))
    }
}

impl Default for LifetimeFixer {
    fn default() -> Self {
        Self::new()
    }
}
