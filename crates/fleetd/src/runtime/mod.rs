//! Runtime components: lifecycle state machine, process control, health
//! probing, restart policy and supervision

pub mod dependency;
pub mod health;
pub mod process;
pub mod restart;
pub mod state;
pub mod supervisor;

pub use dependency::*;
pub use health::*;
pub use process::*;
pub use restart::*;
pub use state::*;
pub use supervisor::*;
