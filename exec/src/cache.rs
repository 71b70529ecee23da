//! Block cache: a slab of compiled entries keyed by
//! `(pc, mode, thumb)`, with patchable successor links and a reverse
//! index for unlinking on invalidation.

use std::collections::HashMap;

use rearm_backend::{patch_jump, CodeBuffer, CompiledBlock, JumpSlot};
use rearm_core::ir::block::BlockKey;

/// One cached compiled block. Successor edges are stored as slab ids
/// (the graph is cyclic; identity must be stable), resolved to direct
/// jumps at patch time.
pub struct BlockEntry {
    pub key: BlockKey,
    /// Guest byte range the block was translated from.
    pub guest_start: u32,
    pub guest_end: u32,
    pub host_offset: usize,
    pub host_size: usize,
    pub jmp_slots: [Option<JumpSlot>; 2],
    /// Outgoing chained edges (destination entry per slot).
    pub jmp_dest: [Option<usize>; 2],
    /// Incoming chained edges: (source id, source slot).
    pub incoming: Vec<(usize, usize)>,
    pub valid: bool,
}

#[derive(Default)]
pub struct BlockCache {
    entries: Vec<BlockEntry>,
    free: Vec<usize>,
    map: HashMap<BlockKey, usize>,
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache::default()
    }

    pub fn lookup(&self, key: BlockKey) -> Option<usize> {
        self.map.get(&key).copied().filter(|&id| self.entries[id].valid)
    }

    pub fn get(&self, id: usize) -> &BlockEntry {
        &self.entries[id]
    }

    /// Reserve a slab id before compiling (the compiled code embeds
    /// its own id in its exit values).
    pub fn reserve(&mut self, key: BlockKey) -> usize {
        let entry = BlockEntry {
            key,
            guest_start: 0,
            guest_end: 0,
            host_offset: 0,
            host_size: 0,
            jmp_slots: [None; 2],
            jmp_dest: [None; 2],
            incoming: Vec::new(),
            valid: false,
        };
        match self.free.pop() {
            Some(id) => {
                self.entries[id] = entry;
                id
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    /// Publish a reserved entry once its code exists.
    pub fn commit(&mut self, id: usize, compiled: CompiledBlock, guest_range: (u32, u32)) {
        let entry = &mut self.entries[id];
        entry.guest_start = guest_range.0;
        entry.guest_end = guest_range.1;
        entry.host_offset = compiled.offset;
        entry.host_size = compiled.size;
        entry.jmp_slots = compiled.jmp_slots;
        entry.valid = true;
        self.map.insert(entry.key, id);
        tracing::debug!(
            id,
            address = entry.key.address,
            thumb = entry.key.thumb,
            size = entry.host_size,
            "block cached"
        );
    }

    /// Drop a reserved entry whose compile failed.
    pub fn abort(&mut self, id: usize) {
        self.free.push(id);
    }

    /// Chain `src`'s exit slot directly to `dst`'s code.
    pub fn link(&mut self, src: usize, slot: usize, dst: usize, buf: &mut CodeBuffer) {
        if !self.entries[src].valid || !self.entries[dst].valid {
            return;
        }
        if self.entries[src].jmp_dest[slot] == Some(dst) {
            return;
        }
        let Some(jmp) = self.entries[src].jmp_slots[slot] else {
            return;
        };

        // Re-linking an already-linked slot first severs the old
        // reverse edge.
        if let Some(old) = self.entries[src].jmp_dest[slot].take() {
            self.entries[old].incoming.retain(|&(s, n)| !(s == src && n == slot));
        }

        let target = self.entries[dst].host_offset;
        patch_jump(buf, jmp, target);
        self.entries[src].jmp_dest[slot] = Some(dst);
        self.entries[dst].incoming.push((src, slot));
        tracing::debug!(src, slot, dst, "blocks chained");
    }

    /// Remove one entry: unpatch every jump into it, sever its own
    /// outgoing edges, and recycle the slab slot.
    pub fn invalidate(&mut self, id: usize, buf: &mut CodeBuffer) {
        if !self.entries[id].valid {
            return;
        }

        let incoming = std::mem::take(&mut self.entries[id].incoming);
        for (src, slot) in incoming {
            if let Some(jmp) = self.entries[src].jmp_slots[slot] {
                patch_jump(buf, jmp, jmp.reset_offset as usize);
            }
            self.entries[src].jmp_dest[slot] = None;
        }

        for slot in 0..2 {
            if let Some(dst) = self.entries[id].jmp_dest[slot].take() {
                self.entries[dst].incoming.retain(|&(s, n)| !(s == id && n == slot));
            }
        }

        let key = self.entries[id].key;
        if self.map.get(&key) == Some(&id) {
            self.map.remove(&key);
        }
        self.entries[id].valid = false;
        self.free.push(id);
        tracing::debug!(id, address = key.address, "block invalidated");
    }

    /// Remove every entry whose guest footprint intersects
    /// `[lo, hi)`. Returns how many were dropped.
    pub fn invalidate_range(&mut self, lo: u32, hi: u32, buf: &mut CodeBuffer) -> usize {
        let hits: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid && e.guest_start < hi && lo < e.guest_end)
            .map(|(id, _)| id)
            .collect();
        for &id in &hits {
            self.invalidate(id, buf);
        }
        hits.len()
    }

    /// Empty the cache entirely. The caller rewinds the code buffer.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free.clear();
        self.map.clear();
        tracing::debug!("block cache flushed");
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rearm_core::psr::Mode;

    fn key(address: u32) -> BlockKey {
        BlockKey {
            address,
            mode: Mode::System,
            thumb: false,
        }
    }

    fn fake_compiled(buf: &mut CodeBuffer) -> CompiledBlock {
        // A block body with one unlinked slot: jmp rel32(0) + stub.
        let offset = buf.offset();
        let jmp_offset = buf.offset() as u32;
        buf.emit_u8(0xE9);
        buf.emit_u32(0);
        let reset_offset = buf.offset() as u32;
        buf.emit_u8(0xC3);
        CompiledBlock {
            offset,
            size: buf.offset() - offset,
            jmp_slots: [
                Some(JumpSlot {
                    jmp_offset,
                    reset_offset,
                }),
                None,
            ],
        }
    }

    #[test]
    fn lookup_after_commit() {
        let mut cache = BlockCache::new();
        let mut buf = CodeBuffer::new(4096).unwrap();
        let id = cache.reserve(key(8));
        assert_eq!(cache.lookup(key(8)), None, "uncommitted entries are invisible");
        let compiled = fake_compiled(&mut buf);
        cache.commit(id, compiled, (0, 4));
        assert_eq!(cache.lookup(key(8)), Some(id));
        assert_eq!(cache.lookup(key(12)), None);
    }

    #[test]
    fn link_patches_and_invalidate_unpatches() {
        let mut cache = BlockCache::new();
        let mut buf = CodeBuffer::new(4096).unwrap();

        let a = cache.reserve(key(8));
        let ca = fake_compiled(&mut buf);
        cache.commit(a, ca, (0, 4));

        let b = cache.reserve(key(12));
        let cb = fake_compiled(&mut buf);
        cache.commit(b, cb, (4, 8));

        cache.link(a, 0, b, &mut buf);
        let jmp = cache.get(a).jmp_slots[0].unwrap();
        let disp = buf.read_u32(jmp.jmp_offset as usize + 1) as i32;
        let target = jmp.jmp_offset as i64 + 5 + disp as i64;
        assert_eq!(target as usize, cache.get(b).host_offset);
        assert_eq!(cache.get(b).incoming, vec![(a, 0)]);

        // Invalidating b must unpatch a's jump back to its stub.
        cache.invalidate(b, &mut buf);
        let disp = buf.read_u32(jmp.jmp_offset as usize + 1) as i32;
        let target = jmp.jmp_offset as i64 + 5 + disp as i64;
        assert_eq!(target as usize, jmp.reset_offset as usize);
        assert_eq!(cache.get(a).jmp_dest[0], None);
        assert_eq!(cache.lookup(key(12)), None);
    }

    #[test]
    fn range_invalidation_uses_guest_footprint() {
        let mut cache = BlockCache::new();
        let mut buf = CodeBuffer::new(4096).unwrap();

        let a = cache.reserve(key(0x1008));
        let ca = fake_compiled(&mut buf);
        cache.commit(a, ca, (0x1000, 0x1010));

        let b = cache.reserve(key(0x2008));
        let cb = fake_compiled(&mut buf);
        cache.commit(b, cb, (0x2000, 0x2008));

        // Range touching only the first block.
        assert_eq!(cache.invalidate_range(0x100C, 0x1010, &mut buf), 1);
        assert_eq!(cache.lookup(key(0x1008)), None);
        assert_eq!(cache.lookup(key(0x2008)), Some(b));

        // Disjoint range touches nothing.
        assert_eq!(cache.invalidate_range(0x3000, 0x4000, &mut buf), 0);
    }

    #[test]
    fn slab_ids_recycled() {
        let mut cache = BlockCache::new();
        let mut buf = CodeBuffer::new(4096).unwrap();
        let a = cache.reserve(key(8));
        let ca = fake_compiled(&mut buf);
        cache.commit(a, ca, (0, 4));
        cache.invalidate(a, &mut buf);
        let b = cache.reserve(key(16));
        assert_eq!(a, b, "freed slot must be reused");
    }
}
