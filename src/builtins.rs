//! Standard word registration: the indicative built-in word surface of §6,
//! minus the four structural specials (`:` `;` `(` `)`) which the compiler
//! dispatches on token kind rather than symbol lookup (the external
//! tokenizer classifies them as SPECIAL, not WORD — see `compiler.rs`).

use crate::digest::Digest;
use crate::error::VmResult;
use crate::opcodes::Op;
use crate::symbol::{Callable, SymbolTable};

/// `(word name, opcode)` pairs with no compile-time operand. `elem`, `slot`
/// and `pack` are handled separately by the compiler's literal-fusion rule
/// (see `compiler.rs`) since they carry a compile-time immediate index/count.
const ZERO_OPERAND_WORDS: &[(&str, Op)] = &[
    ("+", Op::Add),
    ("-", Op::Sub),
    ("*", Op::Mul),
    ("/", Op::Div),
    ("mod", Op::Mod),
    ("neg", Op::Neg),
    ("abs", Op::Abs),
    ("=", Op::Eq),
    ("<", Op::Lt),
    (">", Op::Gt),
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("and", Op::And),
    ("or", Op::Or),
    ("not", Op::Not),
    ("dup", Op::Dup),
    ("drop", Op::Drop),
    ("swap", Op::Swap),
    ("over", Op::Over),
    ("rot", Op::Rot),
    // `eval` and `call` are both "pop a callable and invoke it" at the word
    // level; the engine's `Eval` opcode is the one required primitive for
    // that (§4.5.1), so `call` is registered as a plain alias for it.
    ("eval", Op::Eval),
    ("call", Op::Eval),
    ("exit", Op::Exit),
    ("abort", Op::Abort),
    ("main", Op::Main),
    ("unpack", Op::Unpack),
    ("length", Op::Length),
    ("head", Op::Head),
    ("tail", Op::Tail),
    ("concat", Op::Concat),
    ("fetch", Op::Fetch),
    ("store", Op::Store),
    ("gpush", Op::Gpush),
    ("rpush", Op::Rpush),
];

/// `if`/`else`/`then` (§6, §4.4): immediate words. The compiler executes
/// them at compile time instead of emitting a call, so the `Callable` they
/// resolve to is never dispatched at runtime — only the `is_immediate` flag
/// matters, the opcode is an arbitrary placeholder (see `compiler.rs`'s
/// `compile_immediate`).
const IMMEDIATE_WORDS: &[&str] = &["if", "else", "then"];

/// Register every word in `ZERO_OPERAND_WORDS` plus `nil` (a pseudo-word
/// handled directly by the compiler as a literal-cell emission, so it is
/// *not* added to the symbol table as a callable — see `compiler.rs`'s
/// `compile_word`), plus the immediate control-flow words.
pub fn register_builtins(digest: &mut Digest, symbols: &mut SymbolTable) -> VmResult<()> {
    for &(name, op) in ZERO_OPERAND_WORDS {
        symbols.define_named(digest, name, Callable::Builtin(op.into()), false)?;
    }
    for &name in IMMEDIATE_WORDS {
        symbols.define_named(digest, name, Callable::Builtin(Op::BranchZero.into()), true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_resolves_to_add() {
        let mut digest = Digest::new(1024);
        let mut symbols = SymbolTable::new();
        register_builtins(&mut digest, &mut symbols).unwrap();
        let (callable, immediate) = symbols.find_named(&digest, "+").unwrap();
        assert_eq!(callable, Callable::Builtin(Op::Add.into()));
        assert!(!immediate);
    }

    #[test]
    fn nil_is_not_a_registered_word() {
        let mut digest = Digest::new(1024);
        let mut symbols = SymbolTable::new();
        register_builtins(&mut digest, &mut symbols).unwrap();
        assert_eq!(symbols.find_named(&digest, "nil"), None);
    }

    #[test]
    fn if_else_then_are_registered_immediate() {
        let mut digest = Digest::new(1024);
        let mut symbols = SymbolTable::new();
        register_builtins(&mut digest, &mut symbols).unwrap();
        for name in ["if", "else", "then"] {
            let (_, immediate) = symbols.find_named(&digest, name).unwrap();
            assert!(immediate, "{name} should be immediate");
        }
    }
}
