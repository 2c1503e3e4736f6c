//! Circular intrusive doubly-linked lists threaded through a slotmap arena.
//!
//! Every list is anchored by a sentinel node living in the same arena as its
//! items. A detached node points at itself, so "in a list" is observable on
//! the node alone: `next != self`. All operations are O(1).

use slotmap::{Key, SlotMap};

/// The intrusive link pair embedded in every arena node.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Links<K: Key> {
    prev: K,
    next: K,
}

impl<K: Key> Links<K> {
    /// Links for a node that is in no list: both point at the node itself.
    pub(crate) fn detached(key: K) -> Self {
        Self {
            prev: key,
            next: key,
        }
    }
}

/// Arena nodes that carry intrusive links.
pub(crate) trait Linked<K: Key> {
    fn links(&self) -> &Links<K>;
    fn links_mut(&mut self) -> &mut Links<K>;
}

/// Resets a node to the detached state.
pub(crate) fn init<K: Key, T: Linked<K>>(arena: &mut SlotMap<K, T>, key: K) {
    *arena[key].links_mut() = Links::detached(key);
}

/// Whether the node is threaded into any list.
pub(crate) fn is_linked<K: Key, T: Linked<K>>(arena: &SlotMap<K, T>, key: K) -> bool {
    arena[key].links().next != key
}

/// Whether the list anchored at `sentinel` has no items.
pub(crate) fn is_empty<K: Key, T: Linked<K>>(arena: &SlotMap<K, T>, sentinel: K) -> bool {
    arena[sentinel].links().next == sentinel
}

/// The first item of the list, without removing it.
pub(crate) fn peek<K: Key, T: Linked<K>>(arena: &SlotMap<K, T>, sentinel: K) -> Option<K> {
    let next = arena[sentinel].links().next;
    (next != sentinel).then_some(next)
}

/// Splices the node out of whatever list it is in and re-detaches it.
pub(crate) fn remove<K: Key, T: Linked<K>>(arena: &mut SlotMap<K, T>, key: K) {
    let Links { prev, next } = *arena[key].links();
    arena[next].links_mut().prev = prev;
    arena[prev].links_mut().next = next;
    init(arena, key);
}

/// Removes and returns the first item, or `None` if the list is empty.
pub(crate) fn shift<K: Key, T: Linked<K>>(arena: &mut SlotMap<K, T>, sentinel: K) -> Option<K> {
    let first = peek(arena, sentinel)?;
    remove(arena, first);
    Some(first)
}

/// Appends the node at the tail of the list, detaching it first if needed.
pub(crate) fn append<K: Key, T: Linked<K>>(arena: &mut SlotMap<K, T>, sentinel: K, item: K) {
    if is_linked(arena, item) {
        remove(arena, item);
    }
    let last = arena[sentinel].links().prev;
    arena[last].links_mut().next = item;
    *arena[item].links_mut() = Links { prev: last, next: sentinel };
    arena[sentinel].links_mut().prev = item;
}
