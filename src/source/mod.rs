// Exam server access: the RPC trait and its HTTP implementation.

pub mod http_rpc;
pub mod traits;
