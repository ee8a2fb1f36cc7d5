use std::sync::Arc;

use crate::cell::{ObjectId, ValueRef};
use crate::value::Symbol;

/// One frame of the runtime environment.
///
/// Frames form two independent, acyclic chains:
///
/// - the *lexical* chain via `parent`, walked with de Bruijn coordinates;
/// - the *dynamic* chain via `dyn_link`, which points at the nearest enclosing
///   dynamic-scope frame together with the number of lexical frames skipped to
///   reach it. Only frames created with [`dynamic_child`](Self::dynamic_child)
///   participate in this second chain.
///
/// Cycles exist only in evaluated values, never in these chains.
#[derive(Debug)]
pub struct EnvFrame {
    id: ObjectId,
    slots: Vec<ValueRef>,
    /// Names supplied by this frame, in slot order. `Some` exactly for
    /// dynamic-scope frames.
    names: Option<Arc<[Symbol]>>,
    parent: Option<EnvRef>,
    dyn_link: Option<(EnvRef, u32)>,
}

pub type EnvRef = Arc<EnvFrame>;

impl EnvFrame {
    pub fn root(slots: Vec<ValueRef>) -> EnvRef {
        Arc::new(EnvFrame {
            id: ObjectId::fresh(),
            slots,
            names: None,
            parent: None,
            dyn_link: None,
        })
    }

    /// A lexical child frame.
    pub fn child(self: &Arc<Self>, slots: Vec<ValueRef>) -> EnvRef {
        Arc::new(EnvFrame {
            id: ObjectId::fresh(),
            slots,
            names: None,
            parent: Some(self.clone()),
            dyn_link: self.link_for_child(),
        })
    }

    /// A dynamic-scope child frame supplying `names` (one slot per name).
    pub fn dynamic_child(self: &Arc<Self>, names: Vec<Symbol>, slots: Vec<ValueRef>) -> EnvRef {
        debug_assert_eq!(names.len(), slots.len());
        Arc::new(EnvFrame {
            id: ObjectId::fresh(),
            slots,
            names: Some(names.into()),
            parent: Some(self.clone()),
            dyn_link: self.link_for_child(),
        })
    }

    fn link_for_child(self: &Arc<Self>) -> Option<(EnvRef, u32)> {
        if self.is_dynamic() {
            Some((self.clone(), 1))
        } else {
            self.dyn_link
                .as_ref()
                .map(|(frame, skip)| (frame.clone(), skip + 1))
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn slots(&self) -> &[ValueRef] {
        &self.slots
    }

    pub fn parent(&self) -> Option<&EnvRef> {
        self.parent.as_ref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.names.is_some()
    }

    /// Names supplied by this frame, if it is a dynamic-scope frame.
    pub fn names(&self) -> Option<&[Symbol]> {
        self.names.as_deref()
    }

    /// Resolve a de Bruijn coordinate through the lexical chain.
    pub fn lookup(&self, depth: u32, index: u32) -> Option<&ValueRef> {
        let mut frame = self;
        for _ in 0..depth {
            frame = frame.parent.as_deref()?;
        }
        frame.slots.get(index as usize)
    }

    /// The ordered chain of enclosing dynamic-scope frames, nearest first.
    pub fn dynamic_chain(self: &Arc<Self>) -> Vec<EnvRef> {
        let mut chain = Vec::new();
        let mut cursor = if self.is_dynamic() {
            Some(self.clone())
        } else {
            self.dyn_link.as_ref().map(|(frame, _)| frame.clone())
        };
        while let Some(frame) = cursor {
            cursor = frame.dyn_link.as_ref().map(|(next, _)| next.clone());
            chain.push(frame);
        }
        chain
    }

    /// Resolve a dynamically-scoped name: nearest enclosing dynamic frame
    /// supplying it wins.
    pub fn lookup_dynamic(self: &Arc<Self>, name: &Symbol) -> Option<ValueRef> {
        for frame in self.dynamic_chain() {
            if let Some(names) = frame.names() {
                if let Some(pos) = names.iter().position(|n| n == name) {
                    return frame.slots.get(pos).cloned();
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ValueCell;
    use crate::value::Value;

    fn int(i: i64) -> ValueRef {
        ValueCell::forced(Value::Int(i))
    }

    #[test]
    fn lexical_lookup_walks_parents() {
        let root = EnvFrame::root(vec![int(1), int(2)]);
        let inner = root.child(vec![int(3)]);

        assert_eq!(
            inner
                .lookup(0, 0)
                .unwrap()
                .peek()
                .into_forced()
                .unwrap()
                .as_int(),
            Some(3)
        );
        assert_eq!(
            inner
                .lookup(1, 1)
                .unwrap()
                .peek()
                .into_forced()
                .unwrap()
                .as_int(),
            Some(2)
        );
        assert!(inner.lookup(2, 0).is_none());
    }

    #[test]
    fn dynamic_chain_is_ordered_nearest_first() {
        let root = EnvFrame::root(vec![]);
        let outer = root.dynamic_child(vec![Symbol::new("x")], vec![int(1)]);
        let lexical = outer.child(vec![int(99)]);
        let inner = lexical.dynamic_child(vec![Symbol::new("y")], vec![int(2)]);
        let leaf = inner.child(vec![]);

        let chain: Vec<_> = leaf
            .dynamic_chain()
            .iter()
            .map(|frame| frame.id())
            .collect();
        assert_eq!(chain, vec![inner.id(), outer.id()]);

        // The link records how many frames were skipped to reach the chain.
        let (_, skip) = leaf.dyn_link.as_ref().unwrap();
        assert_eq!(*skip, 1);
    }

    #[test]
    fn dynamic_lookup_nearest_wins() {
        let root = EnvFrame::root(vec![]);
        let outer = root.dynamic_child(vec![Symbol::new("x")], vec![int(1)]);
        let inner = outer.dynamic_child(vec![Symbol::new("x")], vec![int(2)]);

        let hit = inner.lookup_dynamic(&Symbol::new("x")).unwrap();
        assert_eq!(hit.peek().into_forced().unwrap().as_int(), Some(2));
        assert!(inner.lookup_dynamic(&Symbol::new("missing")).is_none());
    }
}
