//! Intrusive doubly linked lists over slab allocated nodes.
//!
//! A node can be a member of several lists at once, one per link role,
//! each list only stores its head, tail and length while the links live
//! inside the node itself. Moving a node between lists never allocates.

use slab::Slab;

/// The null link.
pub const NIL: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// The previous and next node of a list member.
pub struct Link {
    prev: u32,
    next: u32,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
        }
    }
}

/// A node which carries one [Link] per list role.
pub trait Linked {
    /// Returns the link of the given role.
    fn link(&self, role: usize) -> &Link;

    /// Returns the mutable link of the given role.
    fn link_mut(&mut self, role: usize) -> &mut Link;
}

#[derive(Debug, Copy, Clone)]
/// The head of an intrusive list for a single link role.
pub struct ListHead {
    role: usize,
    first: u32,
    last: u32,
    len: usize,
}

impl ListHead {
    /// Create a new empty list using the links of `role`.
    pub const fn new(role: usize) -> Self {
        Self {
            role,
            first: NIL,
            last: NIL,
            len: 0,
        }
    }

    #[inline]
    /// The number of nodes in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    /// Returns if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    /// The first node of the list.
    pub fn first(&self) -> Option<u32> {
        (self.first != NIL).then_some(self.first)
    }

    /// The node following `id`.
    pub fn next<T: Linked>(&self, nodes: &Slab<T>, id: u32) -> Option<u32> {
        let next = nodes[id as usize].link(self.role).next;
        (next != NIL).then_some(next)
    }

    /// Append the node to the end of the list.
    ///
    /// The node must not already be a member of the list.
    pub fn push_back<T: Linked>(&mut self, nodes: &mut Slab<T>, id: u32) {
        let old_last = self.last;
        {
            let link = nodes[id as usize].link_mut(self.role);
            debug_assert_eq!(*link, Link::default(), "node {id} already linked");
            link.prev = old_last;
            link.next = NIL;
        }

        if old_last == NIL {
            self.first = id;
        } else {
            nodes[old_last as usize].link_mut(self.role).next = id;
        }
        self.last = id;
        self.len += 1;
    }

    /// Unlink the node from the list.
    ///
    /// The node must be a member of the list.
    pub fn remove<T: Linked>(&mut self, nodes: &mut Slab<T>, id: u32) {
        let Link { prev, next } = *nodes[id as usize].link(self.role);

        if prev == NIL {
            debug_assert_eq!(self.first, id, "node {id} is not a list member");
            self.first = next;
        } else {
            nodes[prev as usize].link_mut(self.role).next = next;
        }

        if next == NIL {
            debug_assert_eq!(self.last, id, "node {id} is not a list member");
            self.last = prev;
        } else {
            nodes[next as usize].link_mut(self.role).prev = prev;
        }

        *nodes[id as usize].link_mut(self.role) = Link::default();
        self.len -= 1;
    }

    /// Move a member of the list to the end of the list.
    pub fn move_to_back<T: Linked>(&mut self, nodes: &mut Slab<T>, id: u32) {
        if self.last == id {
            return;
        }
        self.remove(nodes, id);
        self.push_back(nodes, id);
    }

    /// Iterate the list from the first to the last node.
    pub fn iter<'a, T: Linked>(&self, nodes: &'a Slab<T>) -> ListIter<'a, T> {
        ListIter {
            nodes,
            role: self.role,
            cursor: self.first,
        }
    }
}

/// Iterates the node IDs of a list.
pub struct ListIter<'a, T> {
    nodes: &'a Slab<T>,
    role: usize,
    cursor: u32,
}

impl<T: Linked> Iterator for ListIter<'_, T> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let id = self.cursor;
        self.cursor = self.nodes[id as usize].link(self.role).next;
        Some(id)
    }
}
