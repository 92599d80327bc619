pub mod config;
pub mod http_pool;
pub mod link;
pub mod poller;
pub mod runtime;
pub mod scheduler;
pub mod throttle;
pub mod ws_conn;

pub use config::*;
pub use http_pool::HttpPool;
pub use link::*;
pub use poller::FallbackPoller;
pub use runtime::*;
pub use scheduler::*;
pub use throttle::*;
pub use ws_conn::*;
