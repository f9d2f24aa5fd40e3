//! Compiler front end (C4, §4.4): turns a token stream into bytecode written
//! into the CODE segment. Tokens are supplied by an external tokenizer
//! (out of scope, §1); this module only defines the categories it consumes
//! (`Token`) and the compile-time protocols that act on them.

use crate::digest::Digest;
use crate::error::{VmError, VmResult};
use crate::memory::{Memory, Segment};
use crate::opcodes::Op;
use crate::symbol::{Callable, SymbolTable};
use crate::value::{Cell, Tag};

/// The four token categories an external tokenizer classifies source text
/// into (§6). `SPECIAL` is narrowed here to the one character this compiler
/// actually dispatches on, rather than carrying the full glyph set.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f32),
    Str(String),
    Word(String),
    /// One of `:` `;` `(` `)` `` ` `` (§6).
    Special(char),
}

/// CP/BP_code registers plus the small amount of state a single-pass
/// compiler needs to track across an open `:`…`;` definition (§4.4).
#[derive(Debug, Default)]
pub struct Compiler {
    cp: u16,
    bp_code: u16,
    /// Branch placeholder offset of the definition currently being
    /// compiled, if any. Tacit does not support nested colon definitions.
    colon_placeholder: Option<u16>,
    /// A `NUMBER` token just seen, not yet committed to bytecode, because it
    /// might fuse with an immediately following `pack`/`elem`/`slot` into a
    /// single opcode-plus-immediate form (§4.6.1's dual compile-time/runtime
    /// operand sourcing for `Pack`, generalized to `Elem`/`Slot`'s index).
    pending_literal: Option<f32>,
    /// Open `if`/`else` branch placeholders, innermost last. `if` pushes its
    /// `BranchZero` placeholder; `else` pops it, pushes its own `Branch`
    /// placeholder; `then` pops whichever is on top. Nested `if`s inside a
    /// branch just push further entries — no separate nesting limit needed.
    control_stack: Vec<u16>,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler::default()
    }

    /// Rebuild a compiler positioned at a previously snapshotted `CP`/
    /// `BP_code` (§11), with no definition open and nothing pending.
    pub fn from_registers(cp: u16, bp_code: u16) -> Self {
        Compiler { cp, bp_code, colon_placeholder: None, pending_literal: None, control_stack: Vec::new() }
    }

    pub fn cp(&self) -> u16 {
        self.cp
    }

    pub fn bp_code(&self) -> u16 {
        self.bp_code
    }

    /// `reset(preserve)` (§4.4): `preserve=false` rewinds `CP` to the start
    /// of the current unit (REPL line reuse); `preserve=true` advances
    /// `BP_code` to `CP` (a definition or block body was just kept).
    pub fn reset(&mut self, preserve: bool) {
        if preserve {
            self.bp_code = self.cp;
        } else {
            self.cp = self.bp_code;
        }
    }

    // --- raw emission -----------------------------------------------------

    fn emit8(&mut self, mem: &mut Memory, byte: u8) -> VmResult<()> {
        mem.write8(Segment::Code, self.cp as usize, byte)?;
        self.cp += 1;
        Ok(())
    }

    fn emit16(&mut self, mem: &mut Memory, value: u16) -> VmResult<()> {
        mem.write16(Segment::Code, self.cp as usize, value)?;
        self.cp += 2;
        Ok(())
    }

    fn emit_raw_cell(&mut self, mem: &mut Memory, bits: u32) -> VmResult<()> {
        mem.write32(Segment::Code, self.cp as usize, bits)?;
        self.cp += 4;
        Ok(())
    }

    fn emit_literal_cell(&mut self, mem: &mut Memory, cell: Cell) -> VmResult<()> {
        self.emit8(mem, Op::LiteralNumber.into())?;
        self.emit_raw_cell(mem, cell.to_bits())
    }

    fn emit_number_literal(&mut self, mem: &mut Memory, n: f32) -> VmResult<()> {
        self.emit_literal_cell(mem, Cell::from_number(n))
    }

    /// Write a 16-bit value at a previously reserved slot (forward jumps).
    fn patch16(&mut self, mem: &mut Memory, offset: u16, value: u16) -> VmResult<()> {
        mem.write16(Segment::Code, offset as usize, value)
    }

    /// Patch a `Branch`/`BranchCall` placeholder (the 2-byte operand slot
    /// reserved right after the opcode byte) with a **signed relative**
    /// offset to the current `CP` (§4.5.1/§6: the offset is taken from the
    /// byte immediately following the operand, i.e. `placeholder + 2`, not
    /// from the opcode itself).
    fn patch_relative_branch(&mut self, mem: &mut Memory, placeholder: u16) -> VmResult<()> {
        let rel = self.cp as i32 - (placeholder as i32 + 2);
        if !(i16::MIN as i32..=i16::MAX as i32).contains(&rel) {
            return Err(VmError::OutOfRange {
                tag: "branch offset",
                value: rel as i64,
                max: i16::MAX as i64,
            });
        }
        self.patch16(mem, placeholder, rel as i16 as u16)
    }

    fn flush_pending_literal(&mut self, mem: &mut Memory) -> VmResult<()> {
        if let Some(n) = self.pending_literal.take() {
            self.emit_number_literal(mem, n)?;
        }
        Ok(())
    }

    fn literal_as_u16(n: f32) -> VmResult<u16> {
        let i = n as i64;
        if !(0..=u16::MAX as i64).contains(&i) {
            return Err(VmError::OutOfRange { tag: "Pack count", value: i, max: u16::MAX as i64 });
        }
        Ok(i as u16)
    }

    fn literal_as_u8(n: f32) -> VmResult<u8> {
        let i = n as i64;
        if !(0..=u8::MAX as i64).contains(&i) {
            return Err(VmError::OutOfRange { tag: "slot index", value: i, max: u8::MAX as i64 });
        }
        Ok(i as u8)
    }

    // --- entry point --------------------------------------------------

    /// Compile a full token stream (one REPL line or one file's worth of
    /// tokens). Emits `Op.Abort` at end-of-stream (§4.4).
    pub fn compile(
        &mut self,
        tokens: &[Token],
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        let mut i = 0;
        while i < tokens.len() {
            self.compile_one(tokens, &mut i, mem, digest, symbols)?;
        }
        if self.colon_placeholder.is_some() {
            return Err(VmError::NestingError("unterminated ':' definition"));
        }
        if !self.control_stack.is_empty() {
            return Err(VmError::NestingError("unterminated 'if'"));
        }
        self.flush_pending_literal(mem)?;
        self.emit8(mem, Op::Abort.into())?;
        Ok(())
    }

    fn compile_one(
        &mut self,
        tokens: &[Token],
        i: &mut usize,
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        match &tokens[*i] {
            Token::Number(n) => {
                self.flush_pending_literal(mem)?;
                self.pending_literal = Some(*n);
                *i += 1;
            }
            Token::Str(s) => {
                self.flush_pending_literal(mem)?;
                let idx = digest.add(s.as_bytes())?;
                self.emit8(mem, Op::LiteralString.into())?;
                self.emit16(mem, idx)?;
                *i += 1;
            }
            Token::Word(w) => {
                if let Some(n) = self.pending_literal {
                    match w.as_str() {
                        "pack" => {
                            self.pending_literal = None;
                            let count = Self::literal_as_u16(n)?;
                            self.emit8(mem, Op::Pack.into())?;
                            self.emit16(mem, count)?;
                            *i += 1;
                            return Ok(());
                        }
                        "elem" => {
                            self.pending_literal = None;
                            let idx = Self::literal_as_u8(n)?;
                            self.emit8(mem, Op::Elem.into())?;
                            self.emit8(mem, idx)?;
                            *i += 1;
                            return Ok(());
                        }
                        "slot" => {
                            self.pending_literal = None;
                            let idx = Self::literal_as_u8(n)?;
                            self.emit8(mem, Op::Slot.into())?;
                            self.emit8(mem, idx)?;
                            *i += 1;
                            return Ok(());
                        }
                        _ => self.flush_pending_literal(mem)?,
                    }
                }
                self.compile_word(w, mem, digest, symbols)?;
                *i += 1;
            }
            Token::Special(c) => {
                self.flush_pending_literal(mem)?;
                match *c {
                    ':' => {
                        *i += 1;
                        let name = match tokens.get(*i) {
                            Some(Token::Word(w)) => w.clone(),
                            _ => return Err(VmError::NestingError("expected name after ':'")),
                        };
                        *i += 1;
                        self.begin_colon(&name, mem, digest, symbols)?;
                    }
                    ';' => {
                        *i += 1;
                        self.end_colon(mem)?;
                    }
                    '(' => {
                        *i += 1;
                        let close = find_matching_close_paren(tokens, *i)?;
                        let span = &tokens[*i..close];
                        self.compile_paren_group(span, true, mem, digest, symbols)?;
                        *i = close + 1;
                    }
                    ')' => return Err(VmError::NestingError("unmatched ')'")),
                    '`' => {
                        *i += 1;
                        let name = match tokens.get(*i) {
                            Some(Token::Word(w)) => w.clone(),
                            _ => return Err(VmError::NestingError("expected word after '`'")),
                        };
                        *i += 1;
                        self.compile_quote(&name, mem, digest, symbols)?;
                    }
                    _ => return Err(VmError::NestingError("unrecognized special token")),
                }
            }
        }
        Ok(())
    }

    // --- colon definitions (§4.4) --------------------------------------

    fn begin_colon(
        &mut self,
        name: &str,
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        if self.colon_placeholder.is_some() {
            return Err(VmError::NestingError("nested ':' definitions are not supported"));
        }
        self.emit8(mem, Op::Branch.into())?;
        let placeholder = self.cp;
        self.emit16(mem, 0)?;
        let entry = self.cp;
        symbols.define_named(digest, name, Callable::Code(entry), false)?;
        self.colon_placeholder = Some(placeholder);
        Ok(())
    }

    fn end_colon(&mut self, mem: &mut Memory) -> VmResult<()> {
        let placeholder = self
            .colon_placeholder
            .take()
            .ok_or(VmError::NestingError("';' without matching ':'"))?;
        self.emit8(mem, Op::Exit.into())?;
        self.patch_relative_branch(mem, placeholder)?;
        self.reset(true);
        Ok(())
    }

    // --- symbol references ----------------------------------------------

    fn compile_word(
        &mut self,
        name: &str,
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        match symbols.find_named(digest, name) {
            Some((_, true)) => self.compile_immediate(name, mem),
            Some((Callable::Builtin(op), false)) => self.emit8(mem, op),
            Some((Callable::Code(addr), false)) => {
                self.emit8(mem, Op::Call.into())?;
                self.emit16(mem, addr)
            }
            None if name == "nil" => self.emit_literal_cell(mem, Cell::nil()),
            None => Err(VmError::UnknownWord(name.to_string())),
        }
    }

    /// Compile-time execution of an immediate word (§4.4). `if`/`else`/
    /// `then` are the only immediate words the core registers; they build
    /// conditional control flow out of `Op::BranchZero`/`Op::Branch`
    /// forward-patched exactly like `begin_colon`/`end_colon`'s placeholder
    /// dance, just tracked on `control_stack` instead of a single field
    /// since `if` can nest.
    fn compile_immediate(&mut self, name: &str, mem: &mut Memory) -> VmResult<()> {
        match name {
            "if" => {
                self.flush_pending_literal(mem)?;
                self.emit8(mem, Op::BranchZero.into())?;
                let placeholder = self.cp;
                self.emit16(mem, 0)?;
                self.control_stack.push(placeholder);
                Ok(())
            }
            "else" => {
                self.flush_pending_literal(mem)?;
                let if_placeholder =
                    self.control_stack.pop().ok_or(VmError::NestingError("'else' without matching 'if'"))?;
                self.emit8(mem, Op::Branch.into())?;
                let else_placeholder = self.cp;
                self.emit16(mem, 0)?;
                self.patch_relative_branch(mem, if_placeholder)?;
                self.control_stack.push(else_placeholder);
                Ok(())
            }
            "then" => {
                self.flush_pending_literal(mem)?;
                let placeholder =
                    self.control_stack.pop().ok_or(VmError::NestingError("'then' without matching 'if'"))?;
                self.patch_relative_branch(mem, placeholder)
            }
            _ => unreachable!("only if/else/then are registered as immediate words"),
        }
    }

    /// Backtick "quote next word": push the word's callable as a data-stack
    /// value instead of invoking it (used to build capsules and to pass
    /// behavior to higher-level combinators built outside the core).
    fn compile_quote(
        &mut self,
        name: &str,
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        match symbols.find_named(digest, name) {
            Some((Callable::Builtin(op), _)) => {
                let cell = Cell::encode_tag(Tag::Builtin, op as i32)?;
                self.emit_literal_cell(mem, cell)
            }
            Some((Callable::Code(addr), _)) => {
                self.emit8(mem, Op::LiteralCode.into())?;
                self.emit16(mem, addr)
            }
            None => Err(VmError::UnknownWord(name.to_string())),
        }
    }

    // --- parenthesized groups: eager list literal vs. deferred block ----

    /// Compile the tokens between a `(`/`)` pair. `wrap` is true for a
    /// top-level group (it must leave exactly one value on the stack: a
    /// packed list, or a CODE ref from a deferred block) and false for a
    /// list literal nested directly inside an enclosing literal list
    /// (§3.3: nested lists embed inline without their own LINK, so no
    /// `Op.Pack` is emitted for them — only their header cell).
    fn compile_paren_group(
        &mut self,
        span: &[Token],
        wrap: bool,
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        if is_all_literal(span) {
            let count = literal_span_cells(span)?;
            if wrap {
                self.emit_items(span, mem, digest, symbols)?;
                self.emit8(mem, Op::Pack.into())?;
                self.emit16(mem, count)?;
            } else {
                let header = Cell::encode_tag(Tag::List, count as i32)?;
                self.emit_literal_cell(mem, header)?;
                self.emit_items(span, mem, digest, symbols)?;
            }
            Ok(())
        } else {
            self.compile_deferred_block(span, mem, digest, symbols)
        }
    }

    /// Emit each item of a literal span's bytecode, in order, with no
    /// wrapping `Pack`/header of its own at this level.
    fn emit_items(
        &mut self,
        span: &[Token],
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        let mut i = 0;
        while i < span.len() {
            match &span[i] {
                Token::Number(n) => {
                    self.emit_number_literal(mem, *n)?;
                    i += 1;
                }
                Token::Str(s) => {
                    let idx = digest.add(s.as_bytes())?;
                    self.emit8(mem, Op::LiteralString.into())?;
                    self.emit16(mem, idx)?;
                    i += 1;
                }
                Token::Special('(') => {
                    let close = find_matching_close_paren(span, i + 1)?;
                    let inner = &span[i + 1..close];
                    self.compile_paren_group(inner, false, mem, digest, symbols)?;
                    i = close + 1;
                }
                Token::Special('`') => {
                    let name = match span.get(i + 1) {
                        Some(Token::Word(w)) => w.clone(),
                        _ => return Err(VmError::NestingError("expected word after '`'")),
                    };
                    self.compile_quote(&name, mem, digest, symbols)?;
                    i += 2;
                }
                Token::Word(_) => {
                    return Err(VmError::NestingError("bare word inside a list literal"));
                }
                Token::Special(_) => {
                    return Err(VmError::NestingError("unexpected special inside a list literal"));
                }
            }
        }
        Ok(())
    }

    /// A `(`…`)` block whose content contains at least one bare word:
    /// compiled as `Op.BranchCall` ... `Op.Exit`, per §4.4's code-block
    /// protocol. Leaves a CODE reference on the data stack at runtime.
    fn compile_deferred_block(
        &mut self,
        span: &[Token],
        mem: &mut Memory,
        digest: &mut Digest,
        symbols: &mut SymbolTable,
    ) -> VmResult<()> {
        self.emit8(mem, Op::BranchCall.into())?;
        let placeholder = self.cp;
        self.emit16(mem, 0)?;
        let mut i = 0;
        while i < span.len() {
            self.compile_one(span, &mut i, mem, digest, symbols)?;
        }
        self.flush_pending_literal(mem)?;
        self.emit8(mem, Op::Exit.into())?;
        self.patch_relative_branch(mem, placeholder)
    }
}

/// Find the index (within `tokens`) of the `)` matching the `(` whose
/// content starts at `start` (`tokens[start]` is the first content token,
/// or already the matching `)` for an empty group).
fn find_matching_close_paren(tokens: &[Token], start: usize) -> VmResult<usize> {
    let mut depth = 1i32;
    let mut j = start;
    while j < tokens.len() {
        match &tokens[j] {
            Token::Special('(') => depth += 1,
            Token::Special(')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    Err(VmError::NestingError("unmatched '('"))
}

/// True iff `span` contains no bare `Token::Word` at its own nesting depth
/// (a word directly quoted by a preceding backtick doesn't count, and
/// nested `(`…`)` groups are opaque — their own word content doesn't
/// disqualify the outer span). This is the dual-mode dispatch rule: a
/// depth-0 bare word means "this group calls something", so it compiles as
/// a deferred code block; otherwise it's a data literal.
fn is_all_literal(span: &[Token]) -> bool {
    let mut depth = 0i32;
    let mut i = 0;
    while i < span.len() {
        match &span[i] {
            Token::Special('(') => depth += 1,
            Token::Special(')') => depth -= 1,
            Token::Special('`') if depth == 0 => {
                i += 2; // skip the quoted word too
                continue;
            }
            Token::Word(_) if depth == 0 => return false,
            _ => {}
        }
        i += 1;
    }
    true
}

/// Total payload cell count a literal span packs into, including nested
/// lists' full header+payload span (§3.3's invariant) but counting each
/// nested deferred block as the single CODE-ref cell its `BranchCall`
/// produces at runtime.
fn literal_span_cells(span: &[Token]) -> VmResult<u16> {
    let mut count: u32 = 0;
    let mut i = 0;
    while i < span.len() {
        match &span[i] {
            Token::Number(_) | Token::Str(_) => {
                count += 1;
                i += 1;
            }
            Token::Special('(') => {
                let close = find_matching_close_paren(span, i + 1)?;
                let inner = &span[i + 1..close];
                if is_all_literal(inner) {
                    count += 1 + literal_span_cells(inner)? as u32;
                } else {
                    count += 1;
                }
                i = close + 1;
            }
            Token::Special('`') => i += 2,
            _ => i += 1,
        }
    }
    if count > u16::MAX as u32 {
        return Err(VmError::OutOfRange { tag: "LIST", value: count as i64, max: u16::MAX as i64 });
    }
    Ok(count as u16)
}
