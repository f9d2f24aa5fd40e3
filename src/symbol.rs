//! Symbol table (C3): a singly-linked list of `{ nameIndex, value,
//! isImmediate, next }` nodes (§4.3). Ported as an arena of nodes plus a
//! head index, per `spec.md` §9's design note ("indices, not pointers").

use crate::digest::Digest;
use crate::error::VmResult;

/// What a symbol resolves to: a built-in opcode index, or a CODE-segment
/// entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callable {
    Builtin(u8),
    Code(u16),
}

#[derive(Debug)]
struct SymbolNode {
    name: u16,
    callable: Callable,
    is_immediate: bool,
    next: Option<usize>,
}

/// Arena-backed symbol table. Definitions prepend, so a later `define` for
/// the same name shadows the earlier one without removing it (the earlier
/// node is simply unreachable from `head`).
#[derive(Debug, Default)]
pub struct SymbolTable {
    nodes: Vec<SymbolNode>,
    head: Option<usize>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { nodes: Vec::new(), head: None }
    }

    pub fn define(&mut self, name: u16, callable: Callable, is_immediate: bool) {
        let next = self.head;
        self.nodes.push(SymbolNode { name, callable, is_immediate, next });
        self.head = Some(self.nodes.len() - 1);
    }

    /// Convenience: register a CODE-tagged callable at `code_addr`.
    pub fn define_call(&mut self, name: u16, code_addr: u16) {
        self.define(name, Callable::Code(code_addr), false);
    }

    /// Intern `name` via `digest` and define it. Used by built-in word
    /// registration at VM construction.
    pub fn define_named(
        &mut self,
        digest: &mut Digest,
        name: &str,
        callable: Callable,
        is_immediate: bool,
    ) -> VmResult<()> {
        let idx = digest.add(name.as_bytes())?;
        self.define(idx, callable, is_immediate);
        Ok(())
    }

    /// Linear scan from `head`; returns the first (most recent) match.
    pub fn find(&self, name: u16) -> Option<(Callable, bool)> {
        let mut cur = self.head;
        while let Some(i) = cur {
            let node = &self.nodes[i];
            if node.name == name {
                return Some((node.callable, node.is_immediate));
            }
            cur = node.next;
        }
        None
    }

    pub fn find_named(&self, digest: &Digest, name: &str) -> Option<(Callable, bool)> {
        digest
            .iter()
            .position(|s| s == name.as_bytes())
            .and_then(|idx| self.find(idx as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_returns_most_recent() {
        let mut digest = Digest::new(1024);
        let mut symbols = SymbolTable::new();
        let name = digest.add(b"square").unwrap();
        symbols.define(name, Callable::Code(10), false);
        symbols.define(name, Callable::Code(20), false);
        assert_eq!(symbols.find(name), Some((Callable::Code(20), false)));
    }

    #[test]
    fn unknown_name_is_none() {
        let digest = Digest::new(1024);
        let symbols = SymbolTable::new();
        assert_eq!(symbols.find_named(&digest, "nope"), None);
    }

    #[test]
    fn immediate_flag_round_trips() {
        let mut digest = Digest::new(1024);
        let mut symbols = SymbolTable::new();
        let name = digest.add(b"if").unwrap();
        symbols.define(name, Callable::Builtin(5), true);
        assert_eq!(symbols.find(name), Some((Callable::Builtin(5), true)));
    }
}
