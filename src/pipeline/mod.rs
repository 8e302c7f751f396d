// SPDX-License-Identifier: MIT
pub mod driver;
pub mod export;
pub mod frame;
pub mod ingest;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod store;
