// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

mod client;
mod request;
mod rpc_controller;

pub use self::client::KvClient;
pub use self::client::KvConnect;
pub use self::request::fill_rpc_context;
pub use self::request::HasRegionError;
pub use self::request::KvRpc;
pub use self::request::StoreRequest;
pub use self::request::StoreResponse;
pub(crate) use self::rpc_controller::RpcController;
