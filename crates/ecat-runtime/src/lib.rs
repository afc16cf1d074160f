#![doc = "Bring-up orchestration and cyclic exchange engine for CST drive networks."]

pub mod bringup;
pub mod context;
pub mod cyclic;
pub mod drive;
pub mod realtime;
pub mod session;
pub mod supervisor;

pub use bringup::*;
pub use context::*;
pub use cyclic::*;
pub use drive::*;
pub use realtime::*;
pub use session::*;
pub use supervisor::*;
