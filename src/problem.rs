use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::conv::ConvolutionParams;
use crate::core::tensor::TensorShape;
use crate::error::{ConvError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    BackwardData,
    BackwardWeights,
}

impl Direction {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Forward => "F",
            Self::BackwardData => "B",
            Self::BackwardWeights => "W",
        }
    }

    pub fn is_forward(self) -> bool {
        self == Self::Forward
    }
}

/// A fully resolved convolution problem.
///
/// `x`, `w` and `y` always hold the forward-pass roles (input, filter,
/// output) whatever the direction; the `in_*`/`out_*` accessors give the
/// direction-relative view a kernel sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProblemDescription {
    direction: Direction,
    x: TensorShape,
    w: TensorShape,
    y: TensorShape,
    params: ConvolutionParams,
}

impl ProblemDescription {
    /// Checks that `y` is exactly the forward output of `x` and `w`.
    pub fn new(
        direction: Direction,
        x: TensorShape,
        w: TensorShape,
        y: TensorShape,
        params: ConvolutionParams,
    ) -> Result<Self> {
        let expected = params.forward_output_shape(&x, &w)?;
        if expected != y {
            return Err(ConvError::ShapeMismatch(format!(
                "output {} does not match {} derived from input {} and filter {}",
                y, expected, x, w
            )));
        }
        Ok(Self { direction, x, w, y, params })
    }

    pub fn forward(x: TensorShape, w: TensorShape, params: ConvolutionParams) -> Result<Self> {
        let y = params.forward_output_shape(&x, &w)?;
        Ok(Self { direction: Direction::Forward, x, w, y, params })
    }

    pub fn backward_data(dy: TensorShape, w: TensorShape, params: ConvolutionParams) -> Result<Self> {
        let dx = params.backward_data_shape(&dy, &w)?;
        Self::new(Direction::BackwardData, dx, w, dy, params)
    }

    pub fn backward_weights(x: TensorShape, dy: TensorShape, params: ConvolutionParams) -> Result<Self> {
        let dw = params.backward_weights_shape(&x, &dy)?;
        Self::new(Direction::BackwardWeights, x, dw, dy, params)
    }

    /// Same shapes, other direction.
    pub fn with_direction(&self, direction: Direction) -> Self {
        Self { direction, ..self.clone() }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn x(&self) -> &TensorShape {
        &self.x
    }

    pub fn w(&self) -> &TensorShape {
        &self.w
    }

    pub fn y(&self) -> &TensorShape {
        &self.y
    }

    pub fn params(&self) -> &ConvolutionParams {
        &self.params
    }

    pub fn batch_size(&self) -> usize {
        self.x.n
    }

    fn data_in(&self) -> &TensorShape {
        match self.direction {
            Direction::BackwardData => &self.y,
            _ => &self.x,
        }
    }

    fn data_out(&self) -> &TensorShape {
        match self.direction {
            Direction::BackwardData => &self.x,
            _ => &self.y,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.data_in().c
    }

    pub fn in_height(&self) -> usize {
        self.data_in().h
    }

    pub fn in_width(&self) -> usize {
        self.data_in().w
    }

    pub fn out_channels(&self) -> usize {
        self.data_out().c
    }

    pub fn out_height(&self) -> usize {
        self.data_out().h
    }

    pub fn out_width(&self) -> usize {
        self.data_out().w
    }

    pub fn filter_height(&self) -> usize {
        self.w.h
    }

    pub fn filter_width(&self) -> usize {
        self.w.w
    }

    /// Element size in bytes of the input tensor.
    pub fn in_type_size(&self) -> usize {
        self.data_in().type_size()
    }

    pub fn out_type_size(&self) -> usize {
        self.data_out().type_size()
    }

    pub fn signature(&self) -> ProblemSignature {
        ProblemSignature::of(self)
    }
}

/// Canonical cache key for a problem.
///
/// Built only from the problem's fields, so two descriptions that compare
/// equal always yield the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProblemSignature(String);

impl ProblemSignature {
    pub fn of(problem: &ProblemDescription) -> Self {
        let dims = |t: &TensorShape| format!("{}x{}x{}x{}", t.n, t.c, t.h, t.w);
        let p = problem.params();
        ProblemSignature(format!(
            "{}-{}-{}-{}-{}-{}-p{}x{}-s{}x{}-d{}x{}-g{}-{}",
            dims(problem.x()),
            dims(problem.w()),
            dims(problem.y()),
            problem.x().dtype.tag(),
            p.mode().name(),
            p.padding().name(),
            p.pad_h(),
            p.pad_w(),
            p.u(),
            p.v(),
            p.dilation_h(),
            p.dilation_w(),
            p.group_count(),
            problem.direction().tag(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProblemSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
