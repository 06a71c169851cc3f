pub mod identity;
pub mod ledger;
pub mod normalize;
pub mod adapters;
pub mod engine;
pub mod monitor;
pub mod session;
pub mod dispatch;
pub mod hub;
pub mod transport;

pub use identity::*;
pub use ledger::*;
pub use engine::*;
pub use monitor::*;
pub use session::*;
pub use dispatch::*;
pub use hub::*;
