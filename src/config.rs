//! VM-wide configuration: per-segment capacities, fixed at construction
//! (§3.2: "Segment boundaries fixed at VM construction; exceeding them via
//! read/write is a fatal `SegmentOverflow`").

/// Capacities for every segment in the memory model (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VmConfig {
    /// CODE segment size, in bytes.
    pub code_bytes: usize,
    /// STRING segment size, in bytes.
    pub string_bytes: usize,
    /// DATA_STACK capacity, in cells.
    pub data_stack_cells: usize,
    /// RETURN_STACK capacity, in cells.
    pub return_stack_cells: usize,
    /// GLOBAL heap capacity, in cells.
    pub global_cells: usize,
}

impl Default for VmConfig {
    /// Capacities comfortably large enough for the worked examples in
    /// `spec.md` §8, but small enough that tests can cheaply drive
    /// `SegmentOverflow`/`StringSegmentFull` by filling a segment.
    fn default() -> Self {
        VmConfig {
            code_bytes: 64 * 1024,
            string_bytes: 64 * 1024,
            data_stack_cells: 4096,
            return_stack_cells: 4096,
            global_cells: 16 * 1024,
        }
    }
}
