pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics;
pub mod model;
pub mod ports;
pub mod rate_limit;
pub mod training;
pub mod trend;

pub use connection::*;
pub use dispatcher::*;
pub use error::*;
pub use event::*;
pub use metrics::*;
pub use model::*;
pub use ports::*;
pub use rate_limit::*;
pub use training::*;
pub use trend::*;
