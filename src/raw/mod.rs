// Copyright 2025 RangeKV Project Authors. Licensed under Apache-2.0.

mod client;
mod sub_batch;

pub use self::client::Client;
