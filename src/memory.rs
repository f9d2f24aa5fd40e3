//! Segmented memory (§3.2): one logical cell array, partitioned into fixed
//! segments. Each segment is either byte-addressed (CODE, STRING) or
//! cell-addressed (DATA_STACK, RETURN_STACK, GLOBAL, VM).
//!
//! Segment boundaries are fixed at construction (`VmConfig`); any access
//! past a segment's capacity is `SegmentOverflow`.

use crate::error::{VmError, VmResult};
use crate::value::Cell;
use crate::VmConfig;

/// Segment identifiers (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Code,
    String,
    DataStack,
    ReturnStack,
    Global,
    /// Scratch storage for the six named registers (IP, SP, RP, BP, CP, GP),
    /// addressed by [`Register`]. The execution engine keeps its own native
    /// copies of these for dispatch speed; this segment exists so the
    /// memory model's read/write contract covers them uniformly, and so
    /// introspection tools (the `tacit-dump` CLI) can read them generically.
    Vm,
}

impl Segment {
    fn name(self) -> &'static str {
        match self {
            Segment::Code => "CODE",
            Segment::String => "STRING",
            Segment::DataStack => "DATA_STACK",
            Segment::ReturnStack => "RETURN_STACK",
            Segment::Global => "GLOBAL",
            Segment::Vm => "VM",
        }
    }
}

/// Index into the VM segment's six register slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Ip = 0,
    Sp = 1,
    Rp = 2,
    Bp = 3,
    Cp = 4,
    Gp = 5,
}

const VM_REGISTER_COUNT: usize = 6;

/// Byte-addressed segment storage (CODE, STRING).
#[derive(Debug)]
struct ByteSegment {
    bytes: Vec<u8>,
    len: usize,
    capacity: usize,
}

impl ByteSegment {
    fn new(capacity: usize) -> Self {
        ByteSegment { bytes: vec![0u8; capacity], len: 0, capacity }
    }

    fn check(&self, offset: usize, width: usize, segment: Segment) -> VmResult<()> {
        if offset + width > self.capacity {
            return Err(VmError::SegmentOverflow {
                segment: segment.name(),
                offset,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// Cell-addressed segment storage (DATA_STACK, RETURN_STACK, GLOBAL, VM).
#[derive(Debug)]
struct CellSegment {
    cells: Vec<Cell>,
    capacity: usize,
}

impl CellSegment {
    fn new(capacity: usize) -> Self {
        CellSegment {
            cells: vec![Cell::from_number(0.0); capacity],
            capacity,
        }
    }

    fn check(&self, idx: usize, segment: Segment) -> VmResult<()> {
        if idx >= self.capacity {
            return Err(VmError::SegmentOverflow {
                segment: segment.name(),
                offset: idx,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}

/// The VM's flat backing memory: one buffer per segment.
#[derive(Debug)]
pub struct Memory {
    code: ByteSegment,
    string: ByteSegment,
    data_stack: CellSegment,
    return_stack: CellSegment,
    global: CellSegment,
    vm: CellSegment,
}

impl Memory {
    pub fn new(config: &VmConfig) -> Self {
        Memory {
            code: ByteSegment::new(config.code_bytes),
            string: ByteSegment::new(config.string_bytes),
            data_stack: CellSegment::new(config.data_stack_cells),
            return_stack: CellSegment::new(config.return_stack_cells),
            global: CellSegment::new(config.global_cells),
            vm: CellSegment::new(VM_REGISTER_COUNT),
        }
    }

    fn cell_segment(&self, segment: Segment) -> &CellSegment {
        match segment {
            Segment::DataStack => &self.data_stack,
            Segment::ReturnStack => &self.return_stack,
            Segment::Global => &self.global,
            Segment::Vm => &self.vm,
            Segment::Code | Segment::String => {
                panic!("{:?} is byte-addressed, not cell-addressed", segment)
            }
        }
    }

    fn cell_segment_mut(&mut self, segment: Segment) -> &mut CellSegment {
        match segment {
            Segment::DataStack => &mut self.data_stack,
            Segment::ReturnStack => &mut self.return_stack,
            Segment::Global => &mut self.global,
            Segment::Vm => &mut self.vm,
            Segment::Code | Segment::String => {
                panic!("{:?} is byte-addressed, not cell-addressed", segment)
            }
        }
    }

    pub fn read_cell(&self, segment: Segment, cell_idx: usize) -> VmResult<Cell> {
        let seg = self.cell_segment(segment);
        seg.check(cell_idx, segment)?;
        Ok(seg.cells[cell_idx])
    }

    pub fn write_cell(
        &mut self,
        segment: Segment,
        cell_idx: usize,
        value: Cell,
    ) -> VmResult<()> {
        let seg = self.cell_segment_mut(segment);
        seg.check(cell_idx, segment)?;
        seg.cells[cell_idx] = value;
        Ok(())
    }

    pub fn read_register(&self, reg: Register) -> Cell {
        self.vm.cells[reg as usize]
    }

    pub fn write_register(&mut self, reg: Register, value: Cell) {
        self.vm.cells[reg as usize] = value;
    }

    fn byte_segment(&self, segment: Segment) -> &ByteSegment {
        match segment {
            Segment::Code => &self.code,
            Segment::String => &self.string,
            _ => panic!("{:?} is cell-addressed, not byte-addressed", segment),
        }
    }

    fn byte_segment_mut(&mut self, segment: Segment) -> &mut ByteSegment {
        match segment {
            Segment::Code => &mut self.code,
            Segment::String => &mut self.string,
            _ => panic!("{:?} is cell-addressed, not byte-addressed", segment),
        }
    }

    /// Logical length already written into a byte segment (used by the
    /// compiler's `CP`/string digest, and by overflow checks that shouldn't
    /// allow writes past what's logically "there" yet).
    pub fn byte_len(&self, segment: Segment) -> usize {
        self.byte_segment(segment).len
    }

    pub fn byte_capacity(&self, segment: Segment) -> usize {
        self.byte_segment(segment).capacity
    }

    /// Cell capacity of a cell-addressed segment, for callers that want to
    /// raise a stack-specific `StackOverflow` ahead of the generic
    /// `SegmentOverflow` a boundary write would otherwise produce.
    pub fn cell_capacity(&self, segment: Segment) -> usize {
        self.cell_segment(segment).capacity
    }

    pub fn read8(&self, segment: Segment, offset: usize) -> VmResult<u8> {
        let seg = self.byte_segment(segment);
        seg.check(offset, 1, segment)?;
        Ok(seg.bytes[offset])
    }

    pub fn read16(&self, segment: Segment, offset: usize) -> VmResult<u16> {
        let seg = self.byte_segment(segment);
        seg.check(offset, 2, segment)?;
        Ok(u16::from_le_bytes([seg.bytes[offset], seg.bytes[offset + 1]]))
    }

    pub fn read32(&self, segment: Segment, offset: usize) -> VmResult<u32> {
        let seg = self.byte_segment(segment);
        seg.check(offset, 4, segment)?;
        let b = &seg.bytes[offset..offset + 4];
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Write a byte at `offset`, extending the segment's logical length if
    /// this is the next unwritten byte (the compiler writes sequentially).
    pub fn write8(&mut self, segment: Segment, offset: usize, value: u8) -> VmResult<()> {
        let seg = self.byte_segment_mut(segment);
        seg.check(offset, 1, segment)?;
        seg.bytes[offset] = value;
        seg.len = seg.len.max(offset + 1);
        Ok(())
    }

    pub fn write16(&mut self, segment: Segment, offset: usize, value: u16) -> VmResult<()> {
        let seg = self.byte_segment_mut(segment);
        seg.check(offset, 2, segment)?;
        let bytes = value.to_le_bytes();
        seg.bytes[offset..offset + 2].copy_from_slice(&bytes);
        seg.len = seg.len.max(offset + 2);
        Ok(())
    }

    pub fn write32(&mut self, segment: Segment, offset: usize, value: u32) -> VmResult<()> {
        let seg = self.byte_segment_mut(segment);
        seg.check(offset, 4, segment)?;
        let bytes = value.to_le_bytes();
        seg.bytes[offset..offset + 4].copy_from_slice(&bytes);
        seg.len = seg.len.max(offset + 4);
        Ok(())
    }

    /// Bytes written so far in CODE, for disassembly / snapshotting.
    pub fn code_bytes(&self) -> &[u8] {
        &self.code.bytes[..self.code.len]
    }

    pub fn string_bytes(&self) -> &[u8] {
        &self.string.bytes[..self.string.len]
    }
}
