//! # Core Abstractions
//!
//! Descriptors and arithmetic shared by every planner component.
//!
//! - **[`tensor`]:** Rank-4 tensor descriptors and element types.
//! - **[`conv`]:** Validated convolution parameters.
//! - **[`shape`]:** Forward and backward shape relationships.
//! - **[`device`]:** The device handle boundary and a simulated device.
//! - **[`config`]:** Runtime switches read from the environment.

pub mod config;
pub mod conv;
pub mod device;
pub mod shape;
pub mod tensor;
