pub mod mem_context;

/// Byte totals across both block spaces.
pub struct MemMetrics {
    pub available: u64,
    pub free: u64,
    pub allocated: u64,
}
