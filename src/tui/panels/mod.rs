// SPDX-License-Identifier: MIT
pub mod header;
pub mod stats;
pub mod timeline;
pub mod viewport;
