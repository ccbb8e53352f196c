//! Infrastructure provisioner abstractions.

pub mod terraform;
mod traits;

pub use terraform::{Terraform, TerraformSettings};
pub use traits::{DestroyScope, Provisioner};
