// SPDX-License-Identifier: MIT
pub mod app;
pub mod input;
pub mod panels;
pub mod playback_bar;
pub mod theme;
