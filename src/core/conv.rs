use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConvError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConvolutionMode {
    Standard,
    Transposed,
    Grouped,
    Depthwise,
}

impl ConvolutionMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Transposed => "transposed",
            Self::Grouped => "grouped",
            Self::Depthwise => "depthwise",
        }
    }

    pub fn is_grouped(self) -> bool {
        matches!(self, Self::Grouped | Self::Depthwise)
    }
}

impl TryFrom<i32> for ConvolutionMode {
    type Error = ConvError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Standard),
            1 => Ok(Self::Transposed),
            2 => Ok(Self::Grouped),
            3 => Ok(Self::Depthwise),
            other => Err(ConvError::Validation(format!(
                "convolution mode {} not supported",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaddingMode {
    Default,
    Same,
    Valid,
}

impl PaddingMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Same => "same",
            Self::Valid => "valid",
        }
    }
}

impl TryFrom<i32> for PaddingMode {
    type Error = ConvError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Default),
            1 => Ok(Self::Same),
            2 => Ok(Self::Valid),
            other => Err(ConvError::InvalidValue(format!("padding mode {}", other))),
        }
    }
}

/// Validated convolution parameters.
///
/// Every constructor checks `pad >= 0`, `stride >= 1` and `dilation >= 1`
/// before anything is built, so a value of this type is always usable by the
/// shape calculator and the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConvolutionParams {
    mode: ConvolutionMode,
    padding: PaddingMode,
    pad_h: usize,
    pad_w: usize,
    u: usize,
    v: usize,
    dilation_h: usize,
    dilation_w: usize,
    group_count: usize,
}

fn checked(pad_h: i32, pad_w: i32, u: i32, v: i32, dilation_h: i32, dilation_w: i32) -> Result<[usize; 6]> {
    if pad_h < 0 || pad_w < 0 || u <= 0 || v <= 0 || dilation_h <= 0 || dilation_w <= 0 {
        return Err(ConvError::Validation(format!(
            "expected padding >= 0, stride >= 1 and dilation >= 1, got pad=({}, {}) stride=({}, {}) dilation=({}, {})",
            pad_h, pad_w, u, v, dilation_h, dilation_w
        )));
    }
    Ok([
        pad_h as usize,
        pad_w as usize,
        u as usize,
        v as usize,
        dilation_h as usize,
        dilation_w as usize,
    ])
}

impl ConvolutionParams {
    /// Standard convolution with default padding policy and a single group.
    pub fn new(pad_h: i32, pad_w: i32, u: i32, v: i32, dilation_h: i32, dilation_w: i32) -> Result<Self> {
        Self::with_modes(
            ConvolutionMode::Standard,
            PaddingMode::Default,
            pad_h,
            pad_w,
            u,
            v,
            dilation_h,
            dilation_w,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_modes(
        mode: ConvolutionMode,
        padding: PaddingMode,
        pad_h: i32,
        pad_w: i32,
        u: i32,
        v: i32,
        dilation_h: i32,
        dilation_w: i32,
    ) -> Result<Self> {
        let [pad_h, pad_w, u, v, dilation_h, dilation_w] =
            checked(pad_h, pad_w, u, v, dilation_h, dilation_w)?;
        Ok(Self {
            mode,
            padding,
            pad_h,
            pad_w,
            u,
            v,
            dilation_h,
            dilation_w,
            group_count: 1,
        })
    }

    /// Same parameters with a different group count (`>= 1`).
    pub fn with_group_count(mut self, group_count: i32) -> Result<Self> {
        if group_count < 1 {
            return Err(ConvError::Validation(format!(
                "group count must be >= 1, got {}",
                group_count
            )));
        }
        self.group_count = group_count as usize;
        Ok(self)
    }

    pub fn mode(&self) -> ConvolutionMode {
        self.mode
    }

    pub fn padding(&self) -> PaddingMode {
        self.padding
    }

    pub fn pad_h(&self) -> usize {
        self.pad_h
    }

    pub fn pad_w(&self) -> usize {
        self.pad_w
    }

    /// Vertical stride.
    pub fn u(&self) -> usize {
        self.u
    }

    /// Horizontal stride.
    pub fn v(&self) -> usize {
        self.v
    }

    pub fn dilation_h(&self) -> usize {
        self.dilation_h
    }

    pub fn dilation_w(&self) -> usize {
        self.dilation_w
    }

    pub fn group_count(&self) -> usize {
        self.group_count
    }

    pub fn is_unit_dilation(&self) -> bool {
        self.dilation_h == 1 && self.dilation_w == 1
    }

    pub fn is_unit_stride(&self) -> bool {
        self.u == 1 && self.v == 1
    }

    pub fn is_zero_pad(&self) -> bool {
        self.pad_h == 0 && self.pad_w == 0
    }

    /// Group multiplier applied to per-group workspace estimates.
    ///
    /// Depthwise convolutions use one group per input channel.
    pub fn groups_for(&self, input_channels: usize) -> usize {
        match self.mode {
            ConvolutionMode::Depthwise => input_channels,
            ConvolutionMode::Grouped => self.group_count,
            _ => 1,
        }
    }
}

impl fmt::Display for ConvolutionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {}, {}, {}, {}, ",
            self.mode.name(),
            self.pad_h,
            self.pad_w,
            self.u,
            self.v,
            self.dilation_h,
            self.dilation_w
        )?;
        if self.mode.is_grouped() {
            write!(f, "{}, ", self.group_count)?;
        }
        Ok(())
    }
}
