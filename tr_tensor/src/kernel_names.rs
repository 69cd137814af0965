//! Names of the kernels the engine and the operator crate agree on.

pub const ADD: &str = "Add";
pub const SUB: &str = "Sub";
pub const MUL: &str = "Mul";
pub const NEG: &str = "Neg";
pub const SQUARE: &str = "Square";
pub const CAST: &str = "Cast";
/// Aliases its input; used by `Engine::clone_tensor`.
pub const IDENTITY: &str = "Identity";
pub const FILL: &str = "Fill";
pub const ZEROS_LIKE: &str = "ZerosLike";
pub const ONES_LIKE: &str = "OnesLike";
pub const SUM: &str = "Sum";
pub const RESHAPE: &str = "Reshape";
