// SPDX-License-Identifier: MIT
//! On-disk clip container: a zstd stream holding a length-prefixed postcard
//! header, length-prefixed postcard frames and an EOF marker.
pub mod format;
pub mod reader;
pub mod writer;
