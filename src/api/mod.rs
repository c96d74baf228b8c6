pub mod dashboard_api;
pub mod simple;

pub use dashboard_api::ProctorDashboard;
pub use simple::init_tracing;
