//! Common types shared by the solver orchestration crates.

pub mod attempt;
pub mod cancel;
pub mod descriptor;
pub mod model;
pub mod race;
pub mod signature;
pub mod validation;

pub use attempt::*;
pub use cancel::*;
pub use descriptor::*;
pub use model::*;
pub use race::*;
pub use signature::*;
pub use validation::*;
