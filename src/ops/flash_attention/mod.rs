//! Flash attention operator: shape resolution, parameters, workspace layout
//! and the create/calculate descriptor.

pub mod descriptor;
pub mod info;
pub mod params;
pub mod workspace;

pub use descriptor::{FlashAttentionDescriptor, NativeTensors};
pub use info::{AttentionShape, MaskShape};
pub use params::{AttentionLayout, FlashAttentionParams, SparseMode};
pub use workspace::{SOFTMAX_STAT_DTYPE, SOFTMAX_STAT_PAD, WorkspaceLayout};
