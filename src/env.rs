// Islet Environments
//
// Lexical frames are reference-counted and shared: closures capture the
// chain in O(1), and a frame is only mutated while its binding form is
// still initializing.

use crate::symbol::SymbolId;
use crate::types::NodeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Identity of a block installer; return-from tokens carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Identity of a tagbody installer; go tokens carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagbodyId(pub u32);

/// One lexical frame holding the statically-scoped namespaces.
#[derive(Debug, Default)]
pub struct Frame {
    vars: RefCell<HashMap<SymbolId, NodeId>>,
    funs: RefCell<HashMap<SymbolId, NodeId>>,
    macros: RefCell<HashMap<SymbolId, NodeId>>,
    blocks: RefCell<HashMap<SymbolId, BlockId>>,
    tags: RefCell<HashMap<SymbolId, TagbodyId>>,
    parent: Option<Rc<Frame>>,
}

/// A handle on a frame chain. Cloning shares frames by reference.
#[derive(Debug, Clone, Default)]
pub struct Env {
    head: Option<Rc<Frame>>,
}

impl Env {
    pub fn new() -> Self {
        Self { head: None }
    }

    /// Push a fresh empty frame over this environment.
    pub fn child(&self) -> Env {
        let frame = Frame {
            parent: self.head.clone(),
            ..Frame::default()
        };
        Env {
            head: Some(Rc::new(frame)),
        }
    }

    pub fn depth(&self) -> usize {
        let mut n = 0;
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            n += 1;
            current = frame.parent.as_ref();
        }
        n
    }

    /// Bind in the innermost frame. Only legal during frame initialization.
    pub fn bind_var(&self, sym: SymbolId, val: NodeId) {
        if let Some(frame) = &self.head {
            frame.vars.borrow_mut().insert(sym, val);
        }
    }

    pub fn bind_fun(&self, sym: SymbolId, val: NodeId) {
        if let Some(frame) = &self.head {
            frame.funs.borrow_mut().insert(sym, val);
        }
    }

    pub fn bind_macro(&self, sym: SymbolId, val: NodeId) {
        if let Some(frame) = &self.head {
            frame.macros.borrow_mut().insert(sym, val);
        }
    }

    pub fn bind_block(&self, sym: SymbolId, id: BlockId) {
        if let Some(frame) = &self.head {
            frame.blocks.borrow_mut().insert(sym, id);
        }
    }

    pub fn bind_tag(&self, sym: SymbolId, id: TagbodyId) {
        if let Some(frame) = &self.head {
            frame.tags.borrow_mut().insert(sym, id);
        }
    }

    pub fn lookup_var(&self, sym: SymbolId) -> Option<NodeId> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if let Some(&val) = frame.vars.borrow().get(&sym) {
                return Some(val);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    pub fn lookup_fun(&self, sym: SymbolId) -> Option<NodeId> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if let Some(&val) = frame.funs.borrow().get(&sym) {
                return Some(val);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    pub fn lookup_macro(&self, sym: SymbolId) -> Option<NodeId> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if let Some(&val) = frame.macros.borrow().get(&sym) {
                return Some(val);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Innermost block installed under this tag symbol.
    pub fn lookup_block(&self, sym: SymbolId) -> Option<BlockId> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if let Some(&id) = frame.blocks.borrow().get(&sym) {
                return Some(id);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Innermost tagbody owning this label.
    pub fn lookup_tag(&self, sym: SymbolId) -> Option<TagbodyId> {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            if let Some(&id) = frame.tags.borrow().get(&sym) {
                return Some(id);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Assign to the innermost existing binding. Returns false if unbound.
    pub fn set_var(&self, sym: SymbolId, val: NodeId) -> bool {
        let mut current = self.head.as_ref();
        while let Some(frame) = current {
            let mut vars = frame.vars.borrow_mut();
            if vars.contains_key(&sym) {
                vars.insert(sym, val);
                return true;
            }
            drop(vars);
            current = frame.parent.as_ref();
        }
        false
    }
}

/// Top-level (global) environment: consulted after lexical frames miss.
/// Class definitions live in the class registry, not here.
#[derive(Debug, Default)]
pub struct TopLevel {
    pub variables: HashMap<SymbolId, NodeId>,
    pub functions: HashMap<SymbolId, NodeId>,
    pub macros: HashMap<SymbolId, NodeId>,
    pub dynamics: HashMap<SymbolId, NodeId>,
}

impl TopLevel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lexical_shadowing() {
        let sym = SymbolId(0);
        let outer = Env::new().child();
        outer.bind_var(sym, NodeId(1));

        let inner = outer.child();
        inner.bind_var(sym, NodeId(2));

        assert_eq!(inner.lookup_var(sym), Some(NodeId(2)));
        assert_eq!(outer.lookup_var(sym), Some(NodeId(1)));
    }

    #[test]
    fn test_capture_shares_frames() {
        let sym = SymbolId(3);
        let env = Env::new().child();
        let captured = env.clone();
        env.bind_var(sym, NodeId(9));
        // The clone sees bindings added to the shared frame.
        assert_eq!(captured.lookup_var(sym), Some(NodeId(9)));
    }

    #[test]
    fn test_set_var_hits_innermost() {
        let sym = SymbolId(1);
        let outer = Env::new().child();
        outer.bind_var(sym, NodeId(1));
        let inner = outer.child();
        inner.bind_var(sym, NodeId(2));

        assert!(inner.set_var(sym, NodeId(7)));
        assert_eq!(inner.lookup_var(sym), Some(NodeId(7)));
        assert_eq!(outer.lookup_var(sym), Some(NodeId(1)));
    }

    #[test]
    fn test_namespaces_independent() {
        let sym = SymbolId(5);
        let env = Env::new().child();
        env.bind_var(sym, NodeId(1));
        assert_eq!(env.lookup_fun(sym), None);
        env.bind_fun(sym, NodeId(2));
        assert_eq!(env.lookup_var(sym), Some(NodeId(1)));
        assert_eq!(env.lookup_fun(sym), Some(NodeId(2)));
    }

    #[test]
    fn test_tag_lookup_innermost() {
        let label = SymbolId(8);
        let outer = Env::new().child();
        outer.bind_tag(label, TagbodyId(1));
        let inner = outer.child();
        inner.bind_tag(label, TagbodyId(2));
        assert_eq!(inner.lookup_tag(label), Some(TagbodyId(2)));
    }
}
