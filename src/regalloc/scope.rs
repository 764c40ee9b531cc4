use super::layout::RegisterId;
use super::lifetime::Representation;
use crate::lang::value::ScalarType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Function,
    Block,
    Loop,
}

/// A named binding and the register it lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub name: String,
    pub reg: RegisterId,
    pub ty: Option<ScalarType>,
    pub repr: Representation,
    /// Set once a nested function closes over it.
    pub captured: bool,
}

#[derive(Debug)]
struct ScopeNode {
    parent: Option<ScopeId>,
    children: Vec<ScopeId>,
    depth: usize,
    kind: ScopeKind,
    locals: Vec<Local>,
    open: bool,
}

/// Lexical scopes of one function, kept in an arena.
///
/// Nodes are never removed; closing a scope tears down its open descendants
/// first (depth-first) and hands back every local declared in them.
#[derive(Debug, Default)]
pub struct ScopeTree {
    nodes: Vec<ScopeNode>,
    current: Option<ScopeId>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.nodes.len());
        let depth = self.depth();
        self.nodes.push(ScopeNode {
            parent: self.current,
            children: Vec::new(),
            depth,
            kind,
            locals: Vec::new(),
            open: true,
        });
        if let Some(parent) = self.current {
            self.nodes[parent.0].children.push(id);
        }
        self.current = Some(id);
        id
    }

    /// Close the innermost scope. Returns its locals, innermost first.
    pub fn exit(&mut self) -> Vec<Local> {
        let Some(id) = self.current else {
            return Vec::new();
        };
        let mut released = Vec::new();
        self.teardown(id, &mut released);
        self.current = self.nodes[id.0].parent;
        released
    }

    fn teardown(&mut self, id: ScopeId, released: &mut Vec<Local>) {
        let children = self.nodes[id.0].children.clone();
        for child in children.into_iter().rev() {
            if self.nodes[child.0].open {
                self.teardown(child, released);
            }
        }
        let node = &mut self.nodes[id.0];
        node.open = false;
        released.extend(node.locals.drain(..).rev());
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.current.map_or(0, |id| self.nodes[id.0].depth + 1)
    }

    pub fn current(&self) -> Option<ScopeId> {
        self.current
    }

    pub fn kind(&self, id: ScopeId) -> ScopeKind {
        self.nodes[id.0].kind
    }

    /// Bind a name in the innermost scope. Shadowing an outer name is fine.
    pub fn declare(&mut self, local: Local) -> bool {
        match self.current {
            Some(id) => {
                self.nodes[id.0].locals.push(local);
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, name: &str) -> Option<&Local> {
        let mut cursor = self.current;
        while let Some(id) = cursor {
            let node = &self.nodes[id.0];
            if let Some(local) = node.locals.iter().rev().find(|l| l.name == name) {
                return Some(local);
            }
            cursor = node.parent;
        }
        None
    }

    pub fn mark_captured(&mut self, name: &str) -> Option<RegisterId> {
        let mut cursor = self.current;
        while let Some(id) = cursor {
            let node = &mut self.nodes[id.0];
            if let Some(local) = node.locals.iter_mut().rev().find(|l| l.name == name) {
                local.captured = true;
                return Some(local.reg);
            }
            cursor = node.parent;
        }
        None
    }

    /// Captured registers declared in the open scopes from the innermost up
    /// to and including `until`. Used before jumping out of those scopes.
    pub fn captured_until(&self, until: ScopeId) -> Vec<RegisterId> {
        let mut regs = Vec::new();
        let mut cursor = self.current;
        while let Some(id) = cursor {
            let node = &self.nodes[id.0];
            regs.extend(node.locals.iter().filter(|l| l.captured).map(|l| l.reg));
            if id == until {
                break;
            }
            cursor = node.parent;
        }
        regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str, reg: u16) -> Local {
        Local {
            name: name.to_string(),
            reg: RegisterId(reg),
            ty: None,
            repr: Representation::Boxed,
            captured: false,
        }
    }

    #[test]
    fn test_inner_shadow_then_outer_resolves_again() {
        let mut scopes = ScopeTree::new();
        scopes.enter(ScopeKind::Function);
        scopes.declare(local("x", 64));
        scopes.enter(ScopeKind::Block);
        scopes.declare(local("x", 65));
        assert_eq!(scopes.resolve("x").unwrap().reg, RegisterId(65));

        let released = scopes.exit();
        assert_eq!(released, vec![local("x", 65)]);
        assert_eq!(scopes.resolve("x").unwrap().reg, RegisterId(64));
    }

    #[test]
    fn test_closed_scope_names_do_not_resolve() {
        let mut scopes = ScopeTree::new();
        scopes.enter(ScopeKind::Function);
        scopes.enter(ScopeKind::Block);
        scopes.declare(local("tmp", 70));
        scopes.exit();
        assert!(scopes.resolve("tmp").is_none());
    }

    #[test]
    fn test_exit_returns_locals_innermost_first() {
        let mut scopes = ScopeTree::new();
        scopes.enter(ScopeKind::Block);
        scopes.declare(local("a", 1));
        scopes.declare(local("b", 2));
        let names: Vec<_> = scopes.exit().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(scopes.depth(), 0);
    }

    #[test]
    fn test_depth_tracking() {
        let mut scopes = ScopeTree::new();
        assert_eq!(scopes.depth(), 0);
        let f = scopes.enter(ScopeKind::Function);
        let l = scopes.enter(ScopeKind::Loop);
        assert_eq!(scopes.depth(), 2);
        assert_eq!(scopes.kind(f), ScopeKind::Function);
        assert_eq!(scopes.kind(l), ScopeKind::Loop);
        scopes.exit();
        assert_eq!(scopes.current(), Some(f));
    }

    #[test]
    fn test_captured_until_stops_at_scope() {
        let mut scopes = ScopeTree::new();
        scopes.enter(ScopeKind::Function);
        scopes.declare(local("outer", 64));
        scopes.mark_captured("outer");
        let lp = scopes.enter(ScopeKind::Loop);
        scopes.declare(local("a", 65));
        scopes.enter(ScopeKind::Block);
        scopes.declare(local("b", 66));
        scopes.mark_captured("b");
        scopes.mark_captured("a");

        let regs = scopes.captured_until(lp);
        assert_eq!(regs, vec![RegisterId(66), RegisterId(65)]);
    }

    #[test]
    fn test_declare_without_scope_fails() {
        let mut scopes = ScopeTree::new();
        assert!(!scopes.declare(local("x", 0)));
    }
}
