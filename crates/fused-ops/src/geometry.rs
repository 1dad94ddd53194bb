//! Launch geometry and per-call stream increments.
//!
//! The increment a fused launch consumes depends on how many elements each
//! thread processes, which in turn depends on the block/grid split chosen for
//! `(rows, cols)` and on the vector width. The same heuristics are used here
//! so that seed offsets advance exactly as a device launch would.

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Bytes loaded per vectorised access.
pub const MAX_CACHE_BYTES: usize = 16;
/// Upper bound on threads per block for the layer-norm kernels.
pub const MAX_LAYERNORM_BLOCK_DIM: usize = 512;

/// Device limits the geometry heuristic depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub max_threads_per_block: usize,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_threads_per_block: 1024,
        }
    }
}

/// Elements per vectorised access for `dtype`, or 1 when `cols` is not a
/// multiple of the natural width.
pub fn vector_width(dtype: DType, cols: usize) -> usize {
    let natural = (MAX_CACHE_BYTES / dtype.size_in_bytes()).max(1);
    if cols % natural == 0 {
        natural
    } else {
        1
    }
}

/// One-dimensional blocks over the columns, one grid row per matrix row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub threads_per_block: usize,
    pub blocks_x: usize,
    pub blocks_y: usize,
}

impl LaunchConfig {
    pub fn blocks_and_grids(caps: &DeviceCapabilities, rows: usize, cols: usize, vec_size: usize) -> Self {
        let vec_cols = cols / vec_size.max(1);
        let threads = vec_cols.min(caps.max_threads_per_block).max(32);
        let blocks_x = ((vec_cols + threads - 1) / threads).max(1);
        Self {
            threads_per_block: threads,
            blocks_x,
            blocks_y: rows.max(1),
        }
    }
}

/// Stream positions each thread consumes in the residual/act kernels.
pub fn residual_increment(caps: &DeviceCapabilities, rows: usize, cols: usize, vec_size: usize) -> u64 {
    let config = LaunchConfig::blocks_and_grids(caps, rows, cols, vec_size);
    let per_launch = config.threads_per_block * config.blocks_x * vec_size;
    (ceil_div(cols, per_launch) * vec_size) as u64
}

/// Power-of-two block size for the row-wise layer-norm kernels.
pub fn desired_block_dim(block_dim: usize) -> usize {
    if block_dim >= MAX_LAYERNORM_BLOCK_DIM {
        MAX_LAYERNORM_BLOCK_DIM
    } else if block_dim == 0 {
        1
    } else {
        1 << (usize::BITS - 1 - block_dim.leading_zeros())
    }
}

/// Stream positions each thread consumes in the fused layer-norm kernel.
pub fn layernorm_increment(cols: usize, vec_size: usize) -> u64 {
    let threads = desired_block_dim(cols / vec_size.max(1));
    (ceil_div(cols, threads * vec_size) * vec_size) as u64
}

fn ceil_div(value: usize, divisor: usize) -> usize {
    if value == 0 {
        0
    } else {
        (value - 1) / divisor + 1
    }
}
