//! The module containing various constants that may be modified by developers.

/// The logging level.
pub const LOGGING_LEVEL: log::LevelFilter = log::LevelFilter::Info;

/// The size of a single base memory block backing guest physical memory.
/// Guest memory is carved into blocks of this size, each allocated from the
/// host (optionally from a specific NUMA zone) and mapped contiguously.
pub const MEM_BLOCK_SIZE_BYTES: u64 = 128 * 1024 * 1024;

/// The capacity of each LAPIC's IRQ submission queue. Submissions beyond this
/// are dropped with an error.
pub const MAX_IRQ_QUEUE_SIZE: usize = 256;

/// The number of guest TSC cycles a vCPU may run before its host thread
/// voluntarily yields at the next loop boundary.
pub const YIELD_CYCLE_PERIOD: u64 = 50_000_000;

/// How many IRQ lines the virtual interrupt architecture carries.
pub const MAX_IRQ: usize = 256;

/// The maximum length of a checkpoint region tag, in bytes.
pub const MAX_CHKPT_TAG_LEN: usize = 64;
