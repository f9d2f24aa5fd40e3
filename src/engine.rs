//! Execution engine (C5) and compound-data operations (C6): fetch-dispatch
//! loop, ordinary and resumable call/return protocols (§4.5), and the
//! stack-resident LIST/LINK/REF primitives (§4.6).

use num_enum::TryFromPrimitive;
use tracing::{debug, trace};

use crate::compiler::{Compiler, Token};
use crate::config::VmConfig;
use crate::digest::Digest;
use crate::error::{VmError, VmResult};
use crate::memory::{Memory, Register, Segment};
use crate::opcodes::Op;
use crate::symbol::SymbolTable;
use crate::value::{Cell, Decoded, Tag};

/// Owns every segment and register threaded through compilation and
/// execution (§9: "model as an explicit VM struct ... no ambient globals").
pub struct Vm {
    config: VmConfig,
    memory: Memory,
    digest: Digest,
    symbols: SymbolTable,
    compiler: Compiler,
    ip: u32,
    sp: usize,
    rp: usize,
    bp: usize,
    gp: usize,
}

impl Vm {
    pub fn new(config: VmConfig) -> VmResult<Self> {
        let mut digest = Digest::new(config.string_bytes);
        let mut symbols = SymbolTable::new();
        crate::builtins::register_builtins(&mut digest, &mut symbols)?;
        Ok(Vm {
            config,
            memory: Memory::new(&config),
            digest,
            symbols,
            compiler: Compiler::new(),
            ip: 0,
            sp: 0,
            rp: 0,
            bp: 0,
            gp: 0,
        })
    }

    /// Rebuild a `Vm` from a persisted snapshot (§11): CODE and the string
    /// digest come from the snapshot, the symbol table and data/return/
    /// global segments start fresh, exactly as a new `Vm::new` would, since
    /// only compiled code and interned strings are durable.
    pub fn from_snapshot(snapshot: &crate::snapshot::Snapshot) -> VmResult<Self> {
        let (memory, mut digest) = snapshot.restore()?;
        let mut symbols = SymbolTable::new();
        crate::builtins::register_builtins(&mut digest, &mut symbols)?;
        let compiler = Compiler::from_registers(snapshot.cp, snapshot.bp_code);
        Ok(Vm {
            config: snapshot.config,
            memory,
            digest,
            symbols,
            compiler,
            ip: 0,
            sp: 0,
            rp: 0,
            bp: 0,
            gp: 0,
        })
    }

    /// Capture the durable portion of this VM's state (§11): CODE bytes,
    /// interned strings, and the compiler's CP/BP_code.
    pub fn snapshot(&self) -> crate::snapshot::Snapshot {
        crate::snapshot::Snapshot::capture(
            self.config,
            &self.memory,
            &self.digest,
            self.compiler.cp(),
            self.compiler.bp_code(),
        )
    }

    pub fn compile(&mut self, tokens: &[Token]) -> VmResult<()> {
        self.compiler
            .compile(tokens, &mut self.memory, &mut self.digest, &mut self.symbols)
    }

    /// Set `IP` to the start of the most recently preserved unit and run it
    /// to completion (`Abort` or a fatal error). This is the entry point a
    /// REPL/file-runner driver uses after `compile`.
    pub fn run_from(&mut self, entry: u16) -> VmResult<()> {
        self.ip = entry as u32;
        self.run()
    }

    pub fn data_stack(&self) -> VmResult<Vec<Cell>> {
        (0..self.sp).map(|i| self.read_dstack(i)).collect()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    fn sync_registers(&mut self) {
        let enc = |v: usize| Cell::from_number(v as f32);
        self.memory.write_register(Register::Ip, Cell::from_number(self.ip as f32));
        self.memory.write_register(Register::Sp, enc(self.sp));
        self.memory.write_register(Register::Rp, enc(self.rp));
        self.memory.write_register(Register::Bp, enc(self.bp));
        self.memory.write_register(Register::Cp, Cell::from_number(self.compiler.cp() as f32));
        self.memory.write_register(Register::Gp, enc(self.gp));
    }

    // --- fetch-dispatch loop (§4.5) --------------------------------------

    fn fetch_operand(&mut self, width: usize) -> VmResult<u32> {
        let v = match width {
            0 => 0,
            1 => self.memory.read8(Segment::Code, self.ip as usize)? as u32,
            2 => self.memory.read16(Segment::Code, self.ip as usize)? as u32,
            4 => self.memory.read32(Segment::Code, self.ip as usize)?,
            _ => unreachable!("operand widths are 0/1/2/4"),
        };
        self.ip += width as u32;
        Ok(v)
    }

    /// `Branch`/`BranchCall` carry a signed relative offset (§4.5.1/§6) from
    /// the instruction following the operand, i.e. `self.ip` as already
    /// advanced past the operand by `fetch_operand` when this is called.
    fn branch_target(&self, operand: u32) -> u32 {
        (self.ip as i32 + operand as u16 as i16 as i32) as u32
    }

    fn run(&mut self) -> VmResult<()> {
        loop {
            let byte = self.memory.read8(Segment::Code, self.ip as usize)?;
            self.ip += 1;
            if byte >= 128 {
                return Err(VmError::TypeError {
                    context: "dispatch",
                    expected: "opcode < 128",
                    found: "user opcode",
                });
            }
            let op = Op::try_from_primitive(byte).map_err(|_| VmError::InvalidTag(byte))?;
            let operand = self.fetch_operand(crate::opcodes::operand_size(op))?;
            trace!(?op, operand, ip = self.ip, sp = self.sp, rp = self.rp, bp = self.bp, "dispatch");
            if self.dispatch(op, operand)? {
                self.sync_registers();
                return Ok(());
            }
        }
    }

    /// Execute one opcode. Returns `Ok(true)` if the engine should halt
    /// (`Abort`).
    fn dispatch(&mut self, op: Op, operand: u32) -> VmResult<bool> {
        use Op::*;
        match op {
            LiteralNumber => {
                self.push_data(Cell::from_bits(operand))?;
            }
            LiteralString => self.push_data(Cell::encode_tag(Tag::String, operand as i32)?)?,
            LiteralCode => self.push_data(Cell::encode_tag(Tag::Code, operand as i32)?)?,
            Dup => {
                let v = self.peek_data(0)?;
                self.push_data(v)?;
            }
            Drop => {
                self.pop_data()?;
            }
            Swap => {
                let a = self.pop_data()?;
                let b = self.pop_data()?;
                self.push_data(a)?;
                self.push_data(b)?;
            }
            Over => {
                let v = self.peek_data(1)?;
                self.push_data(v)?;
            }
            Rot => {
                let c = self.pop_data()?;
                let b = self.pop_data()?;
                let a = self.pop_data()?;
                self.push_data(b)?;
                self.push_data(c)?;
                self.push_data(a)?;
            }
            Add | Sub | Mul | Div | Mod => self.binary_arith(op)?,
            Neg => {
                let v = self.pop_number()?;
                self.push_data(Cell::from_number(-v))?;
            }
            Abs => {
                let v = self.pop_number()?;
                self.push_data(Cell::from_number(v.abs()))?;
            }
            Eq | Lt | Gt | Le | Ge => self.compare(op)?,
            And => {
                let b = self.pop_number()? != 0.0;
                let a = self.pop_number()? != 0.0;
                self.push_bool(a && b)?;
            }
            Or => {
                let b = self.pop_number()? != 0.0;
                let a = self.pop_number()? != 0.0;
                self.push_bool(a || b)?;
            }
            Not => {
                let a = self.pop_number()? != 0.0;
                self.push_bool(!a)?;
            }
            Branch => self.ip = self.branch_target(operand),
            BranchCall => {
                let entry = self.ip;
                self.push_data(Cell::encode_tag(Tag::Code, entry as i32)?)?;
                self.ip = self.branch_target(operand);
            }
            BranchZero => {
                let v = self.pop_number()?;
                if v == 0.0 {
                    self.ip = self.branch_target(operand);
                }
            }
            Call => self.push_frame(operand as u16)?,
            Exit => self.op_exit()?,
            Eval => self.op_eval()?,
            Abort => return Ok(true),
            Main => self.op_main()?,
            Reserve => {
                self.ensure_rstack_capacity(operand as usize)?;
                for _ in 0..operand {
                    self.write_rstack(self.rp, Cell::from_number(0.0))?;
                    self.rp += 1;
                }
            }
            LocalGet => {
                let v = self.read_rstack(self.bp + 1 + operand as usize)?;
                self.push_data(v)?;
            }
            LocalSet => {
                let v = self.pop_data()?;
                self.write_rstack(self.bp + 1 + operand as usize, v)?;
            }
            LocalAddr => {
                let idx = self.bp + 1 + operand as usize;
                self.push_data(Cell::encode_tag(Tag::RefRstack, idx as i32)?)?;
            }
            Pack => self.pack_cells(operand as u16)?,
            PackDyn => {
                let n = self.pop_number()? as u16;
                self.pack_cells(n)?;
            }
            Unpack => self.op_unpack()?,
            Length => self.op_length()?,
            Head => self.op_head_tail(true)?,
            Tail => self.op_head_tail(false)?,
            Concat => self.op_concat()?,
            Elem => self.op_elem_slot(operand as u8, false)?,
            Slot => self.op_elem_slot(operand as u8, true)?,
            Fetch => self.op_fetch()?,
            Store => self.op_store()?,
            Gpush => self.op_gpush()?,
            Rpush => self.op_rpush()?,
        }
        Ok(false)
    }

    // --- data/return stack primitives ------------------------------------

    fn read_dstack(&self, idx: usize) -> VmResult<Cell> {
        self.memory.read_cell(Segment::DataStack, idx)
    }

    fn write_dstack(&mut self, idx: usize, v: Cell) -> VmResult<()> {
        self.memory.write_cell(Segment::DataStack, idx, v)
    }

    fn read_rstack(&self, idx: usize) -> VmResult<Cell> {
        self.memory.read_cell(Segment::ReturnStack, idx)
    }

    fn write_rstack(&mut self, idx: usize, v: Cell) -> VmResult<()> {
        self.memory.write_cell(Segment::ReturnStack, idx, v)
    }

    /// Return stack cells needed beyond `self.rp` before a growth op (§7:
    /// `StackOverflow` is raised ahead of the generic `SegmentOverflow` a
    /// boundary write would otherwise produce, so callers learn "the stack
    /// is full" rather than "a write landed out of bounds").
    fn ensure_rstack_capacity(&self, additional: usize) -> VmResult<()> {
        if self.rp + additional > self.memory.cell_capacity(Segment::ReturnStack) {
            return Err(VmError::StackOverflow { segment: "RETURN_STACK" });
        }
        Ok(())
    }

    fn push_data(&mut self, v: Cell) -> VmResult<()> {
        if self.sp >= self.memory.cell_capacity(Segment::DataStack) {
            return Err(VmError::StackOverflow { segment: "DATA_STACK" });
        }
        self.write_dstack(self.sp, v)?;
        self.sp += 1;
        Ok(())
    }

    fn pop_data(&mut self) -> VmResult<Cell> {
        if self.sp == 0 {
            return Err(VmError::StackUnderflow { needed: 1, available: 0 });
        }
        self.sp -= 1;
        self.read_dstack(self.sp)
    }

    fn peek_data(&self, depth: usize) -> VmResult<Cell> {
        if self.sp <= depth {
            return Err(VmError::StackUnderflow { needed: depth + 1, available: self.sp });
        }
        self.read_dstack(self.sp - 1 - depth)
    }

    fn push_bool(&mut self, b: bool) -> VmResult<()> {
        self.push_data(Cell::from_number(if b { 1.0 } else { 0.0 }))
    }

    fn pop_number(&mut self) -> VmResult<f32> {
        match self.pop_data()?.decode()? {
            Decoded::Number(n) => Ok(n),
            Decoded::Tagged { tag, .. } => Err(VmError::TypeError {
                context: "arithmetic",
                expected: "NUMBER",
                found: tag_name(tag),
            }),
        }
    }

    fn binary_arith(&mut self, op: Op) -> VmResult<()> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        let result = match op {
            Op::Add => a + b,
            Op::Sub => a - b,
            Op::Mul => a * b,
            Op::Div => a / b,
            Op::Mod => a % b,
            _ => unreachable!(),
        };
        self.push_data(Cell::from_number(result))
    }

    fn compare(&mut self, op: Op) -> VmResult<()> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        let result = match op {
            Op::Eq => a == b,
            Op::Lt => a < b,
            Op::Gt => a > b,
            Op::Le => a <= b,
            Op::Ge => a >= b,
            _ => unreachable!(),
        };
        self.push_bool(result)
    }

    // --- ordinary call/return (§4.5.2) -----------------------------------

    fn push_frame(&mut self, addr: u16) -> VmResult<()> {
        self.ensure_rstack_capacity(3)?;
        let return_addr = self.ip;
        self.write_rstack(self.rp, Cell::encode_tag(Tag::Code, return_addr as i32)?)?;
        self.rp += 1;
        self.write_rstack(self.rp, Cell::from_number(0.0))?; // reserved main-entry slot
        self.rp += 1;
        self.write_rstack(self.rp, Cell::from_number(self.bp as f32))?;
        self.rp += 1;
        self.bp = self.rp - 1;
        self.ip = addr as u32;
        debug!(addr, bp = self.bp, rp = self.rp, "call");
        Ok(())
    }

    /// A frame's reserved main-entry slot (`BP-1`) starts as `NUMBER(0.0)`
    /// (`push_frame`) and is only ever overwritten with a `CODE` resume
    /// address by `op_main`. The only way execution reaches past a `Main`
    /// is through `do_resume` jumping to that address, so a `CODE` cell
    /// there at the moment of `Exit` means this `Exit` is returning from the
    /// frame's main phase, not from its first (ordinary) call.
    fn is_main_phase_return(&self, bp: usize) -> VmResult<bool> {
        Ok(matches!(self.read_rstack(bp - 1)?.decode()?, Decoded::Tagged { tag: Tag::Code, .. }))
    }

    fn op_exit(&mut self) -> VmResult<()> {
        if self.bp < 2 {
            return Err(VmError::NestingError("Exit with no active call frame"));
        }
        let bp = self.bp;
        let old_bp_cell = self.read_rstack(bp)?;
        let return_cell = self.read_rstack(bp - 2)?;
        // Return from main phase (§4.5.3): leave RP untouched so the frame's
        // locals, still in the body of the return stack, survive for the
        // next resume. Ancestor cleanup (§4.5.5) reclaims the space when the
        // frame that originally owned it exits ordinarily.
        if !self.is_main_phase_return(bp)? {
            self.rp = bp - 2;
        }
        self.bp = match old_bp_cell.decode()? {
            Decoded::Number(n) => n as usize,
            Decoded::Tagged { tag, .. } => {
                return Err(VmError::TypeError { context: "Exit/old-BP", expected: "NUMBER", found: tag_name(tag) })
            }
        };
        self.ip = match return_cell.decode()? {
            Decoded::Tagged { tag: Tag::Code, payload } => payload as u32,
            other => {
                return Err(VmError::TypeError {
                    context: "Exit/return-address",
                    expected: "CODE",
                    found: decoded_name(other),
                })
            }
        };
        debug!(new_bp = self.bp, new_ip = self.ip, "exit");
        Ok(())
    }

    // --- resumable functions (§4.5.3) -------------------------------------

    fn op_main(&mut self) -> VmResult<()> {
        if self.bp < 2 {
            return Err(VmError::NestingError("Main with no active call frame"));
        }
        let resume_ip = self.ip;
        self.write_rstack(self.bp - 1, Cell::encode_tag(Tag::Code, resume_ip as i32)?)?;
        let old_bp_cell = self.read_rstack(self.bp)?;
        let return_cell = self.read_rstack(self.bp - 2)?;
        let handle = self.bp;
        self.bp = match old_bp_cell.decode()? {
            Decoded::Number(n) => n as usize,
            Decoded::Tagged { tag, .. } => {
                return Err(VmError::TypeError { context: "Main/old-BP", expected: "NUMBER", found: tag_name(tag) })
            }
        };
        self.ip = match return_cell.decode()? {
            Decoded::Tagged { tag: Tag::Code, payload } => payload as u32,
            other => {
                return Err(VmError::TypeError {
                    context: "Main/return-address",
                    expected: "CODE",
                    found: decoded_name(other),
                })
            }
        };
        self.push_data(Cell::encode_tag(Tag::RefRstack, handle as i32)?)?;
        debug!(handle, new_bp = self.bp, "suspend (init->suspended)");
        Ok(())
    }

    fn do_resume(&mut self, saved_bp: usize) -> VmResult<()> {
        if saved_bp == self.bp {
            return Err(VmError::SelfReentry);
        }
        let main_entry_cell = self.read_rstack(saved_bp - 1)?;
        let main_entry = match main_entry_cell.decode()? {
            Decoded::Tagged { tag: Tag::Code, payload } => payload,
            Decoded::Number(_) => return Err(VmError::UninitializedResume(saved_bp as u32)),
            Decoded::Tagged { tag, .. } => {
                return Err(VmError::TypeError { context: "Eval/resume", expected: "CODE", found: tag_name(tag) })
            }
        };
        self.write_rstack(saved_bp, Cell::from_number(self.bp as f32))?;
        self.write_rstack(saved_bp - 2, Cell::encode_tag(Tag::Code, self.ip as i32)?)?;
        self.bp = saved_bp;
        self.ip = main_entry as u32;
        debug!(saved_bp, "resume (suspended->main-active)");
        Ok(())
    }

    fn op_eval(&mut self) -> VmResult<()> {
        let tos = self.peek_data(0)?;
        match tos.decode()? {
            Decoded::Tagged { tag: Tag::Link, .. } => self.eval_capsule(),
            Decoded::Tagged { tag: Tag::Code, payload } => {
                self.pop_data()?;
                self.push_frame(payload)
            }
            Decoded::Tagged { tag: Tag::Builtin, payload } => {
                self.pop_data()?;
                let op = Op::try_from_primitive(payload as u8).map_err(|_| VmError::InvalidTag(payload as u8))?;
                let operand = 0; // every directly-callable builtin word takes no operand (see builtins.rs)
                self.dispatch(op, operand).map(|_| ())
            }
            Decoded::Tagged { tag: Tag::RefRstack, payload } => {
                self.pop_data()?;
                self.do_resume(payload as usize)
            }
            other => Err(VmError::TypeError { context: "Eval", expected: "callable", found: decoded_name(other) }),
        }
    }

    /// A capsule: a LIST whose last payload cell is a callable. Evaluating
    /// it pushes the preceding cells, then invokes the callable.
    fn eval_capsule(&mut self) -> VmResult<()> {
        let link_idx = self.sp - 1;
        let (header_idx, n) = self.list_header_index(link_idx)?;
        if n == 0 {
            return Err(VmError::TypeError { context: "Eval/capsule", expected: "non-empty list", found: "LIST:0" });
        }
        let callable_cell = self.read_dstack(header_idx + n as usize)?;
        let preceding: Vec<Cell> =
            (0..n as usize - 1).map(|k| self.read_dstack(header_idx + 1 + k)).collect::<VmResult<_>>()?;
        self.sp = header_idx;
        for c in preceding {
            self.push_data(c)?;
        }
        match callable_cell.decode()? {
            Decoded::Tagged { tag: Tag::Code, payload } => self.push_frame(payload),
            Decoded::Tagged { tag: Tag::Builtin, payload } => {
                let op = Op::try_from_primitive(payload as u8).map_err(|_| VmError::InvalidTag(payload as u8))?;
                self.dispatch(op, 0).map(|_| ())
            }
            other => Err(VmError::TypeError {
                context: "Eval/capsule",
                expected: "CODE or BUILTIN callable",
                found: decoded_name(other),
            }),
        }
    }

    // --- compound data (C6, §4.6) -----------------------------------------

    /// Given the index of a `LINK` cell, return `(header_idx, n)` where `n`
    /// is the list's payload cell count.
    fn list_header_index(&self, link_idx: usize) -> VmResult<(usize, u16)> {
        let link = self.read_dstack(link_idx)?;
        let distance = match link.decode()? {
            Decoded::Tagged { tag: Tag::Link, payload } => payload,
            other => {
                return Err(VmError::TypeError { context: "list access", expected: "LINK", found: decoded_name(other) })
            }
        };
        let header_idx = link_idx
            .checked_sub(distance as usize)
            .ok_or(VmError::NestingError("LINK distance underflows stack"))?;
        let header = self.read_dstack(header_idx)?;
        let n = match header.decode()? {
            Decoded::Tagged { tag: Tag::List, payload } => payload,
            other => {
                return Err(VmError::TypeError { context: "list access", expected: "LIST", found: decoded_name(other) })
            }
        };
        Ok((header_idx, n))
    }

    /// Logical elements of a list's payload: `(offset, span)` pairs where
    /// `offset` is relative to `header_idx + 1` and `span` is the number of
    /// raw cells the element occupies (1 for a simple value, `inner_n + 1`
    /// for a nested list header + its own payload). §3.3's invariant that a
    /// parent's payload count includes a nested list's full span means
    /// `Length`/`Elem` must walk elements, not raw cells (locked by S4).
    fn logical_elements(&self, header_idx: usize, n: u16) -> VmResult<Vec<(u16, u16)>> {
        let mut elements = Vec::new();
        let mut offset = 0u16;
        while offset < n {
            let cell = self.read_dstack(header_idx + 1 + offset as usize)?;
            let span = match cell.decode()? {
                Decoded::Tagged { tag: Tag::List, payload } => payload + 1,
                _ => 1,
            };
            elements.push((offset, span));
            offset += span;
        }
        Ok(elements)
    }

    fn pack_cells(&mut self, n: u16) -> VmResult<()> {
        let n = n as usize;
        if self.sp < n {
            return Err(VmError::StackUnderflow { needed: n, available: self.sp });
        }
        let header_idx = self.sp - n;
        for k in (0..n).rev() {
            let v = self.read_dstack(header_idx + k)?;
            self.write_dstack(header_idx + 1 + k, v)?;
        }
        self.write_dstack(header_idx, Cell::encode_tag(Tag::List, n as i32)?)?;
        self.sp = header_idx + 1 + n;
        self.write_dstack(self.sp, Cell::encode_tag(Tag::Link, (n + 1) as i32)?)?;
        self.sp += 1;
        Ok(())
    }

    fn op_unpack(&mut self) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let n = n as usize;
        for k in 0..n {
            let v = self.read_dstack(header_idx + 1 + k)?;
            self.write_dstack(header_idx + k, v)?;
        }
        self.sp = header_idx + n;
        Ok(())
    }

    fn op_length(&mut self) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let count = self.logical_elements(header_idx, n)?.len();
        self.sp = header_idx;
        self.push_data(Cell::from_number(count as f32))
    }

    /// `Elem`/`Slot` (§12 resolution #3/#4 family): both consume the whole
    /// source list and index its `i`-th logical element. `Elem` pushes the
    /// element's materialized value; `Slot` additionally spills it to
    /// GLOBAL and pushes a `REF_GLOBAL` to it, for later `Store`/`LocalAddr`
    /// use.
    fn op_elem_slot(&mut self, index: u8, as_slot: bool) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let elements = self.logical_elements(header_idx, n)?;
        let (offset, span) = *elements
            .get(index as usize)
            .ok_or(VmError::OutOfRange { tag: "elem index", value: index as i64, max: elements.len() as i64 - 1 })?;
        if as_slot {
            let cells: Vec<Cell> = (0..span as usize)
                .map(|k| self.read_dstack(header_idx + 1 + offset as usize + k))
                .collect::<VmResult<_>>()?;
            self.sp = header_idx;
            let ref_cell = self.spill_to_global(&cells)?;
            self.push_data(ref_cell)
        } else {
            self.materialize_at(header_idx, offset, span)
        }
    }

    fn op_head_tail(&mut self, head: bool) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let elements = self.logical_elements(header_idx, n)?;
        let (first_offset, first_span) =
            *elements.first().ok_or(VmError::NestingError("head/tail of an empty list"))?;
        debug_assert_eq!(first_offset, 0);
        if head {
            self.materialize_at(header_idx, 0, first_span)
        } else {
            let new_n = n - first_span;
            let remaining: Vec<Cell> = (0..new_n as usize)
                .map(|k| self.read_dstack(header_idx + 1 + first_span as usize + k))
                .collect::<VmResult<_>>()?;
            self.sp = header_idx;
            self.write_dstack(header_idx, Cell::encode_tag(Tag::List, new_n as i32)?)?;
            for (k, c) in remaining.into_iter().enumerate() {
                self.write_dstack(header_idx + 1 + k, c)?;
            }
            self.sp = header_idx + 1 + new_n as usize;
            self.push_data(Cell::encode_tag(Tag::Link, (new_n + 1) as i32)?)
        }
    }

    fn materialize_at(&mut self, header_idx: usize, offset: u16, span: u16) -> VmResult<()> {
        let cells: Vec<Cell> = (0..span as usize)
            .map(|k| self.read_dstack(header_idx + 1 + offset as usize + k))
            .collect::<VmResult<_>>()?;
        self.sp = header_idx;
        if span == 1 {
            self.push_data(cells[0])
        } else {
            for c in &cells {
                self.push_data(*c)?;
            }
            self.push_data(Cell::encode_tag(Tag::Link, span as i32)?)
        }
    }

    /// Read a value's raw cells (simple: 1 cell; list: header + N payload,
    /// no LINK) at the top of the data stack without consuming them, for
    /// `Concat`'s shape dispatch.
    fn peek_operand_span(&self, top: usize) -> VmResult<(usize, u16, bool)> {
        let tos = self.read_dstack(top)?;
        if let Decoded::Tagged { tag: Tag::Link, .. } = tos.decode()? {
            let (header_idx, n) = self.list_header_index(top)?;
            Ok((header_idx, n, true))
        } else {
            Ok((top, 0, false))
        }
    }

    fn op_concat(&mut self) -> VmResult<()> {
        let rhs_top = self.sp - 1;
        let (rhs_start, rhs_n, rhs_is_list) = self.peek_operand_span(rhs_top)?;
        if rhs_start == 0 {
            return Err(VmError::StackUnderflow { needed: 2, available: 1 });
        }
        let lhs_top = rhs_start - 1;
        let (lhs_start, lhs_n, lhs_is_list) = self.peek_operand_span(lhs_top)?;

        let lhs_payload = |vm: &Vm| -> VmResult<Vec<Cell>> {
            if lhs_is_list {
                (0..lhs_n as usize).map(|k| vm.read_dstack(lhs_start + 1 + k)).collect()
            } else {
                Ok(vec![vm.read_dstack(lhs_start)?])
            }
        };
        let rhs_payload = |vm: &Vm| -> VmResult<Vec<Cell>> {
            if rhs_is_list {
                (0..rhs_n as usize).map(|k| vm.read_dstack(rhs_start + 1 + k)).collect()
            } else {
                Ok(vec![vm.read_dstack(rhs_start)?])
            }
        };
        let mut result = lhs_payload(self)?;
        result.extend(rhs_payload(self)?);
        let result_n = result.len();

        self.sp = lhs_start;
        self.write_dstack(lhs_start, Cell::encode_tag(Tag::List, result_n as i32)?)?;
        for (k, c) in result.into_iter().enumerate() {
            self.write_dstack(lhs_start + 1 + k, c)?;
        }
        self.sp = lhs_start + 1 + result_n;
        self.push_data(Cell::encode_tag(Tag::Link, (result_n + 1) as i32)?)
    }

    /// Spill a value's raw cells (already read out of the data stack) to
    /// the GLOBAL heap, returning a `REF_GLOBAL` to their new location
    /// (§4.6.4, generalized from "a list" to "any value span").
    fn spill_to_global(&mut self, cells: &[Cell]) -> VmResult<Cell> {
        let addr = self.gp;
        for (k, c) in cells.iter().enumerate() {
            self.memory.write_cell(Segment::Global, addr + k, *c)?;
        }
        self.gp += cells.len();
        Cell::encode_tag(Tag::RefGlobal, addr as i32)
    }

    fn op_gpush(&mut self) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let cells: Vec<Cell> =
            (0..=n as usize).map(|k| self.read_dstack(header_idx + k)).collect::<VmResult<_>>()?;
        self.sp = header_idx;
        let ref_cell = self.spill_to_global(&cells)?;
        self.push_data(ref_cell)
    }

    fn op_rpush(&mut self) -> VmResult<()> {
        let (header_idx, n) = self.list_header_index(self.sp - 1)?;
        let total = n as usize + 1;
        let cells: Vec<Cell> = (0..total).map(|k| self.read_dstack(header_idx + k)).collect::<VmResult<_>>()?;
        self.sp = header_idx;
        self.ensure_rstack_capacity(total)?;
        let dest = self.rp;
        for (k, c) in cells.into_iter().enumerate() {
            self.write_rstack(dest + k, c)?;
        }
        self.rp += total;
        Ok(())
    }

    fn resolve_ref(&self, r: Cell) -> VmResult<(Segment, usize)> {
        match r.decode()? {
            Decoded::Tagged { tag: Tag::RefStack, payload } => Ok((Segment::DataStack, payload as usize)),
            Decoded::Tagged { tag: Tag::RefRstack, payload } => Ok((Segment::ReturnStack, payload as usize)),
            Decoded::Tagged { tag: Tag::RefGlobal, payload } => Ok((Segment::Global, payload as usize)),
            other => Err(VmError::TypeError { context: "ref", expected: "REF", found: decoded_name(other) }),
        }
    }

    /// `Fetch` (resolution #2): materializes the whole list if the target
    /// cell is a LIST header, so callers can use it uniformly with
    /// `Unpack`/`Length`/`Concat`.
    fn op_fetch(&mut self) -> VmResult<()> {
        let r = self.pop_data()?;
        let (seg, idx) = self.resolve_ref(r)?;
        let target = self.memory.read_cell(seg, idx)?;
        match target.decode()? {
            Decoded::Tagged { tag: Tag::List, payload: n } => {
                let n = n as usize;
                for k in 0..=n {
                    let c = self.memory.read_cell(seg, idx + k)?;
                    self.push_data(c)?;
                }
                self.push_data(Cell::encode_tag(Tag::Link, (n + 1) as i32)?)
            }
            _ => self.push_data(target),
        }
    }

    /// `Store` (§4.6.5): `value, ref` with `ref` on top. Rejects
    /// cross-shape and differing-length list writes as `ShapeMismatch`.
    fn op_store(&mut self) -> VmResult<()> {
        let r = self.pop_data()?;
        let (seg, idx) = self.resolve_ref(r)?;
        let current = self.memory.read_cell(seg, idx)?;
        let current_n = match current.decode()? {
            Decoded::Tagged { tag: Tag::List, payload } => Some(payload),
            _ => None,
        };
        let (value_start, value_n, value_is_list) = self.peek_operand_span(self.sp - 1)?;
        match (current_n, value_is_list) {
            (Some(old_n), true) if old_n == value_n => {
                let cells: Vec<Cell> =
                    (0..=value_n as usize).map(|k| self.read_dstack(value_start + k)).collect::<VmResult<_>>()?;
                for (k, c) in cells.into_iter().enumerate() {
                    self.memory.write_cell(seg, idx + k, c)?;
                }
                self.sp = value_start;
                Ok(())
            }
            (None, false) => {
                let v = self.pop_data()?;
                self.memory.write_cell(seg, idx, v)
            }
            (old, new) => Err(VmError::ShapeMismatch {
                old_shape: if old.is_some() { "LIST" } else { "SIMPLE" },
                new_shape: if new { "LIST" } else { "SIMPLE" },
            }),
        }
    }
}

fn tag_name(tag: Tag) -> &'static str {
    match tag {
        Tag::Integer => "INTEGER",
        Tag::Code => "CODE",
        Tag::Builtin => "BUILTIN",
        Tag::String => "STRING",
        Tag::List => "LIST",
        Tag::Link => "LINK",
        Tag::RefStack => "REF_STACK",
        Tag::RefRstack => "REF_RSTACK",
        Tag::RefGlobal => "REF_GLOBAL",
        Tag::Sentinel => "SENTINEL",
    }
}

fn decoded_name(d: Decoded) -> &'static str {
    match d {
        Decoded::Number(_) => "NUMBER",
        Decoded::Tagged { tag, .. } => tag_name(tag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Token;

    fn num(n: f32) -> Token {
        Token::Number(n)
    }
    fn word(w: &str) -> Token {
        Token::Word(w.to_string())
    }
    fn sp(c: char) -> Token {
        Token::Special(c)
    }

    fn run_tokens(vm: &mut Vm, tokens: &[Token]) -> VmResult<()> {
        let entry = vm.compiler().bp_code();
        vm.compile(tokens)?;
        vm.run_from(entry)
    }

    #[test]
    fn s1_square_then_inc() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[
                sp(':'), word("square"), word("dup"), word("*"), sp(';'),
                sp(':'), word("inc"), num(1.0), word("+"), sp(';'),
                num(5.0), word("square"), word("inc"),
            ],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(26.0));
    }

    #[test]
    fn s3_concat_length() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[
                sp('('), num(1.0), num(2.0), sp(')'),
                sp('('), num(3.0), num(4.0), sp(')'),
                word("concat"), word("length"),
            ],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(4.0));
    }

    #[test]
    fn s4_nested_list_logical_length() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[sp('('), num(1.0), sp('('), num(2.0), num(3.0), sp(')'), num(4.0), sp(')'), word("length")],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(3.0));
    }

    #[test]
    fn s6_empty_list_length_zero() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(&mut vm, &[sp('('), sp(')'), word("length")]).unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(0.0));
    }

    #[test]
    fn pack_then_unpack_is_identity() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[num(7.0), num(8.0), num(9.0), num(3.0), word("pack"), word("unpack")],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack.iter().map(|c| match c.decode().unwrap() {
            Decoded::Number(n) => n,
            _ => panic!("expected numbers"),
        }).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn drop_from_empty_stack_underflows() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let err = run_tokens(&mut vm, &[word("drop")]).unwrap_err();
        assert!(matches!(err, VmError::StackUnderflow { needed: 1, available: 0 }));
    }

    #[test]
    fn data_stack_full_raises_stack_overflow_not_segment_overflow() {
        let config = VmConfig { data_stack_cells: 2, ..VmConfig::default() };
        let mut vm = Vm::new(config).unwrap();
        let err = run_tokens(&mut vm, &[num(1.0), num(2.0), num(3.0)]).unwrap_err();
        assert!(matches!(err, VmError::StackOverflow { segment: "DATA_STACK" }));
    }

    #[test]
    fn return_stack_full_raises_stack_overflow_on_call() {
        let config = VmConfig { return_stack_cells: 2, ..VmConfig::default() };
        let mut vm = Vm::new(config).unwrap();
        let err = run_tokens(
            &mut vm,
            &[sp(':'), word("f"), num(1.0), sp(';'), word("f")],
        )
        .unwrap_err();
        assert!(matches!(err, VmError::StackOverflow { segment: "RETURN_STACK" }));
    }

    #[test]
    fn store_shape_mismatch_is_fatal() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let err = run_tokens(
            &mut vm,
            &[
                sp('('), num(1.0), num(2.0), sp(')'), word("gpush"),
                num(9.0), word("over"), word("store"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, VmError::ShapeMismatch { .. }));
    }

    #[test]
    fn concat_simple_simple_creates_two_element_list() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(&mut vm, &[num(10.0), num(20.0), word("concat"), word("length")]).unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(2.0));
    }

    #[test]
    fn fetch_materializes_list() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[
                sp('('), num(1.0), num(2.0), num(3.0), sp(')'), word("gpush"),
                word("fetch"), word("length"),
            ],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.last().unwrap().decode().unwrap(), Decoded::Number(3.0));
    }

    #[test]
    fn head_tail_consume() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(&mut vm, &[sp('('), num(5.0), num(6.0), num(7.0), sp(')'), word("head")]).unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(5.0));

        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[sp('('), num(5.0), num(6.0), num(7.0), sp(')'), word("tail"), word("length")],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(2.0));
    }

    fn emit8(mem: &mut Memory, cp: &mut usize, b: u8) {
        mem.write8(Segment::Code, *cp, b).unwrap();
        *cp += 1;
    }

    fn emit16(mem: &mut Memory, cp: &mut usize, v: u16) {
        mem.write16(Segment::Code, *cp, v).unwrap();
        *cp += 2;
    }

    fn emit_num(mem: &mut Memory, cp: &mut usize, n: f32) {
        emit8(mem, cp, Op::LiteralNumber.into());
        mem.write32(Segment::Code, *cp, Cell::from_number(n).to_bits()).unwrap();
        *cp += 4;
    }

    /// S5: a resumable counter, hand-assembled directly (`Reserve`/
    /// `LocalGet`/`LocalSet` have no source-level word syntax, see
    /// `compiler.rs`). `0 counter-init` suspends at `Main` with state `0` in
    /// its one local; each `h eval` returns the current state and increments
    /// it for next time.
    #[test]
    fn s5_resumable_counter_yields_0_1_2() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let mut cp = 0usize;
        {
            let mem = &mut vm.memory;
            emit8(mem, &mut cp, Op::Branch.into());
            let branch_operand_at = cp;
            emit16(mem, &mut cp, 0);

            let entry = cp as u16;
            emit8(mem, &mut cp, Op::Reserve.into());
            emit8(mem, &mut cp, 1);
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Main.into());

            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit_num(mem, &mut cp, 1.0);
            emit8(mem, &mut cp, Op::Add.into());
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Exit.into());

            let rel = (cp as i32 - (branch_operand_at as i32 + 2)) as i16 as u16;
            mem.write16(Segment::Code, branch_operand_at, rel).unwrap();

            emit_num(mem, &mut cp, 0.0);
            emit8(mem, &mut cp, Op::Call.into());
            emit16(mem, &mut cp, entry);

            // Each round leaves the returned value on top of the handle
            // (the body pushes it after the handle's copy is consumed by
            // `Eval`); `Swap` brings the handle back to the top so the next
            // `Dup` duplicates it again instead of the just-returned number.
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());
            emit8(mem, &mut cp, Op::Drop.into());
            emit8(mem, &mut cp, Op::Abort.into());
        }
        vm.run_from(0).unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack
            .iter()
            .map(|c| match c.decode().unwrap() {
                Decoded::Number(n) => n,
                other => panic!("expected numbers, got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    /// Regression for the main-phase `Exit` fix: an ordinary call sandwiched
    /// between two resumptions of a live token must not disturb the
    /// coroutine's saved locals. Before the fix, the first resumption's
    /// trailing `Exit` rolled `RP` back below the counter's own frame, and
    /// the intervening `bump` call then wrote its frame metadata right on
    /// top of it.
    #[test]
    fn resume_survives_an_intervening_ordinary_call() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let mut cp = 0usize;
        {
            let mem = &mut vm.memory;
            emit8(mem, &mut cp, Op::Branch.into());
            let counter_branch_at = cp;
            emit16(mem, &mut cp, 0);

            let counter_entry = cp as u16;
            emit8(mem, &mut cp, Op::Reserve.into());
            emit8(mem, &mut cp, 1);
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Main.into());
            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit_num(mem, &mut cp, 1.0);
            emit8(mem, &mut cp, Op::Add.into());
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Exit.into());

            let rel = (cp as i32 - (counter_branch_at as i32 + 2)) as i16 as u16;
            mem.write16(Segment::Code, counter_branch_at, rel).unwrap();

            emit8(mem, &mut cp, Op::Branch.into());
            let bump_branch_at = cp;
            emit16(mem, &mut cp, 0);

            let bump_entry = cp as u16;
            emit8(mem, &mut cp, Op::Reserve.into());
            emit8(mem, &mut cp, 1);
            emit_num(mem, &mut cp, 99.0);
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Exit.into());

            let rel = (cp as i32 - (bump_branch_at as i32 + 2)) as i16 as u16;
            mem.write16(Segment::Code, bump_branch_at, rel).unwrap();

            emit_num(mem, &mut cp, 0.0);
            emit8(mem, &mut cp, Op::Call.into());
            emit16(mem, &mut cp, counter_entry);

            // `Swap` brings the handle back on top after each `Eval` leaves
            // its returned value there, so the intervening ordinary call and
            // the next round's `Dup` both see the handle, not the number.
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());

            emit8(mem, &mut cp, Op::Call.into());
            emit16(mem, &mut cp, bump_entry);
            emit8(mem, &mut cp, Op::Drop.into());

            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::Eval.into());
            emit8(mem, &mut cp, Op::Swap.into());
            emit8(mem, &mut cp, Op::Drop.into());
            emit8(mem, &mut cp, Op::Abort.into());
        }
        vm.run_from(0).unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack
            .iter()
            .map(|c| match c.decode().unwrap() {
                Decoded::Number(n) => n,
                other => panic!("expected numbers, got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0]);
    }

    /// A local that holds a ref spilled by `gpush` dereferences in one hop:
    /// `LocalGet` followed directly by `Fetch` reaches the spilled payload,
    /// with no second indirection to chase.
    #[test]
    fn gpush_then_local_store_round_trips_through_one_indirection() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let mut cp = 0usize;
        {
            let mem = &mut vm.memory;
            emit8(mem, &mut cp, Op::Branch.into());
            let branch_operand_at = cp;
            emit16(mem, &mut cp, 0);

            let entry = cp as u16;
            emit8(mem, &mut cp, Op::Reserve.into());
            emit8(mem, &mut cp, 1);
            emit_num(mem, &mut cp, 1.0);
            emit_num(mem, &mut cp, 2.0);
            emit_num(mem, &mut cp, 3.0);
            emit8(mem, &mut cp, Op::Pack.into());
            emit16(mem, &mut cp, 3);
            emit8(mem, &mut cp, Op::Gpush.into());
            emit8(mem, &mut cp, Op::LocalSet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::LocalGet.into());
            emit8(mem, &mut cp, 0);
            emit8(mem, &mut cp, Op::Fetch.into());
            emit8(mem, &mut cp, Op::Length.into());
            emit8(mem, &mut cp, Op::Exit.into());

            let rel = (cp as i32 - (branch_operand_at as i32 + 2)) as i16 as u16;
            mem.write16(Segment::Code, branch_operand_at, rel).unwrap();

            emit8(mem, &mut cp, Op::Call.into());
            emit16(mem, &mut cp, entry);
            emit8(mem, &mut cp, Op::Abort.into());
        }
        vm.run_from(0).unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(3.0));
    }

    /// Hand-assembled countdown loop: `BranchZero` forward out of the loop,
    /// `Branch` backward to its head. Locks that both use a signed offset
    /// relative to the instruction following the 2-byte operand, not an
    /// absolute address — a backward jump is only representable as negative.
    #[test]
    fn branch_offset_is_relative_to_following_instruction() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let mut cp = 0usize;
        {
            let mem = &mut vm.memory;
            emit_num(mem, &mut cp, 3.0);

            let loop_start = cp as u16;
            emit8(mem, &mut cp, Op::Dup.into());
            emit8(mem, &mut cp, Op::BranchZero.into());
            let exit_operand_at = cp;
            emit16(mem, &mut cp, 0);
            emit_num(mem, &mut cp, 1.0);
            emit8(mem, &mut cp, Op::Sub.into());
            emit8(mem, &mut cp, Op::Branch.into());
            let back_operand_at = cp;
            let back_rel = (loop_start as i32 - (back_operand_at as i32 + 2)) as i16 as u16;
            emit16(mem, &mut cp, back_rel);
            assert!((back_rel as i16) < 0, "backward jump must be a negative offset");

            let loop_exit = cp as u16;
            let exit_rel = (loop_exit as i32 - (exit_operand_at as i32 + 2)) as i16 as u16;
            mem.write16(Segment::Code, exit_operand_at, exit_rel).unwrap();
            assert!((exit_rel as i16) > 0, "forward jump must be a positive offset");

            emit8(mem, &mut cp, Op::Abort.into());
        }
        vm.run_from(0).unwrap();
        let stack = vm.data_stack().unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].decode().unwrap(), Decoded::Number(0.0));
    }

    #[test]
    fn if_then_skips_the_true_branch_when_condition_is_zero() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[num(0.0), word("if"), num(99.0), word("then"), num(1.0)],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack
            .iter()
            .map(|c| match c.decode().unwrap() {
                Decoded::Number(n) => n,
                other => panic!("expected numbers, got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1.0]);
    }

    #[test]
    fn if_then_runs_the_true_branch_when_condition_is_nonzero() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[num(1.0), word("if"), num(99.0), word("then"), num(1.0)],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack
            .iter()
            .map(|c| match c.decode().unwrap() {
                Decoded::Number(n) => n,
                other => panic!("expected numbers, got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![99.0, 1.0]);
    }

    #[test]
    fn if_else_then_picks_a_branch_by_condition() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        run_tokens(
            &mut vm,
            &[
                sp(':'), word("sign"),
                word("if"), num(1.0), word("else"), num(-1.0), word("then"),
                sp(';'),
                num(0.0), word("sign"),
                num(7.0), word("sign"),
            ],
        )
        .unwrap();
        let stack = vm.data_stack().unwrap();
        let values: Vec<f32> = stack
            .iter()
            .map(|c| match c.decode().unwrap() {
                Decoded::Number(n) => n,
                other => panic!("expected numbers, got {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![-1.0, 1.0]);
    }

    #[test]
    fn builtin_payload_127_ok_128_rejects() {
        assert!(Cell::encode_tag(Tag::Builtin, 127).is_ok());
        assert!(Cell::encode_tag(Tag::Builtin, 128).is_err());
    }
}
