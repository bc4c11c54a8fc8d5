//! Shape arithmetic for the four convolution modes.
//!
//! All arithmetic runs on signed integers so that a filter larger than its
//! (padded) input can never wrap into a huge unsigned extent.

use crate::core::conv::{ConvolutionMode, ConvolutionParams, PaddingMode};
use crate::core::tensor::TensorShape;
use crate::error::{ConvError, Result};

fn ensure_same_type(a: &TensorShape, b: &TensorShape) -> Result<()> {
    if a.dtype != b.dtype {
        return Err(ConvError::ShapeMismatch(format!(
            "types do not match for the filter: {} vs {}",
            a.dtype.tag(),
            b.dtype.tag()
        )));
    }
    Ok(())
}

fn ceil_div(num: i64, den: i64) -> i64 {
    -((-num).div_euclid(den))
}

fn positive(value: i64, what: &str) -> Result<usize> {
    if value < 1 {
        return Err(ConvError::ShapeMismatch(format!(
            "inconsistent shapes: derived {} is {}",
            what, value
        )));
    }
    Ok(value as usize)
}

impl ConvolutionParams {
    fn check_forward_channels(&self, input: &TensorShape, filter: &TensorShape) -> Result<()> {
        let (input_c, filter_k, filter_c) = (input.c, filter.n, filter.c);
        let mode = self.mode();
        let ok = match mode {
            ConvolutionMode::Standard => input_c == filter_c,
            ConvolutionMode::Transposed => input_c == filter_k,
            ConvolutionMode::Grouped => {
                filter_c != 0
                    && input_c % filter_c == 0
                    && input_c / filter_c != 0
                    && filter_k % (input_c / filter_c) == 0
            }
            ConvolutionMode::Depthwise => filter_c == 1 && input_c != 0 && filter_k % input_c == 0,
        };
        if ok {
            return Ok(());
        }
        let expected = match mode {
            ConvolutionMode::Transposed => filter_k,
            _ => filter_c,
        };
        Err(ConvError::ChannelMismatch {
            mode: mode.name(),
            input: input_c,
            filter: expected,
        })
    }

    /// Output shape `(N, C_out, H_out, W_out)` of a forward convolution.
    pub fn forward_output_shape(&self, input: &TensorShape, filter: &TensorShape) -> Result<TensorShape> {
        ensure_same_type(input, filter)?;
        self.check_forward_channels(input, filter)?;

        let (in_h, in_w) = (input.h as i64, input.w as i64);
        let (filter_h, filter_w) = (filter.h as i64, filter.w as i64);
        let (u, v) = (self.u() as i64, self.v() as i64);
        let (pad_h, pad_w) = (self.pad_h() as i64, self.pad_w() as i64);
        let (dil_h, dil_w) = (self.dilation_h() as i64, self.dilation_w() as i64);

        let plain = self.is_unit_dilation() && self.mode() == ConvolutionMode::Standard;
        let (out_c, out_h, out_w) = match self.padding() {
            PaddingMode::Same if plain => (filter.n, ceil_div(in_h, u), ceil_div(in_w, v)),
            PaddingMode::Valid if plain => {
                let out_h = ceil_div(in_h - filter_h + 1, u);
                let out_w = ceil_div(in_w - filter_w + 1, v);
                if out_h < 1 || out_w < 1 {
                    return Err(ConvError::ShapeMismatch(format!(
                        "valid padding with a {}x{} filter on a {}x{} input",
                        filter_h, filter_w, in_h, in_w
                    )));
                }
                (filter.n, out_h, out_w)
            }
            _ if self.mode() == ConvolutionMode::Transposed => (
                filter.c,
                (u * (in_h - 1) + 1 + dil_h * (filter_h - 1) - 2 * pad_h).max(1),
                (v * (in_w - 1) + 1 + dil_w * (filter_w - 1) - 2 * pad_w).max(1),
            ),
            _ => (
                filter.n,
                ((in_h - (1 + dil_h * (filter_h - 1)) + 2 * pad_h).div_euclid(u) + 1).max(1),
                ((in_w - (1 + dil_w * (filter_w - 1)) + 2 * pad_w).div_euclid(v) + 1).max(1),
            ),
        };

        Ok(TensorShape::new(input.dtype, input.n, out_c, out_h as usize, out_w as usize))
    }

    /// Shape of the data gradient `dx` given the output gradient `dy` and the filter.
    ///
    /// `dy` channels must equal the filter's output channels.
    pub fn backward_data_shape(&self, dy: &TensorShape, filter: &TensorShape) -> Result<TensorShape> {
        ensure_same_type(dy, filter)?;
        let groups = if self.mode().is_grouped() { self.group_count() } else { 1 };
        if dy.c != filter.n {
            return Err(ConvError::ChannelMismatch {
                mode: self.mode().name(),
                input: dy.c,
                filter: filter.n,
            });
        }
        let (u, v) = (self.u() as i64, self.v() as i64);
        let h = u * (dy.h as i64 - 1) - 2 * self.pad_h() as i64 + filter.h as i64;
        let w = v * (dy.w as i64 - 1) - 2 * self.pad_w() as i64 + filter.w as i64;
        Ok(TensorShape::new(
            dy.dtype,
            dy.n,
            filter.c * groups,
            positive(h, "input height")?,
            positive(w, "input width")?,
        ))
    }

    /// Filter shape implied by an input `x` and an output gradient `dy`.
    ///
    /// `filter_h = 2*pad_h + x.h - u*(dy.h - 1)`, symmetric for width. The
    /// caller must pass shapes that came from the same forward problem: when
    /// `(x.h + 2*pad_h - filter_h)` is not a multiple of the stride the
    /// derived extent overshoots the real filter by the remainder.
    pub fn backward_weights_shape(&self, x: &TensorShape, dy: &TensorShape) -> Result<TensorShape> {
        ensure_same_type(x, dy)?;
        let groups = self.groups_for(x.c);
        let (u, v) = (self.u() as i64, self.v() as i64);
        let h = 2 * self.pad_h() as i64 + x.h as i64 - u * (dy.h as i64 - 1);
        let w = 2 * self.pad_w() as i64 + x.w as i64 - v * (dy.w as i64 - 1);
        Ok(TensorShape::new(
            dy.dtype,
            dy.c,
            x.c / groups.max(1),
            positive(h, "filter height")?,
            positive(w, "filter width")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tensor::DataType;

    fn t(n: usize, c: usize, h: usize, w: usize) -> TensorShape {
        TensorShape::new(DataType::Float, n, c, h, w)
    }

    #[test]
    fn standard_forward_with_padding() {
        let p = ConvolutionParams::new(1, 1, 1, 1, 1, 1).unwrap();
        let y = p.forward_output_shape(&t(2, 3, 32, 32), &t(16, 3, 3, 3)).unwrap();
        assert_eq!(y.lengths(), [2, 16, 32, 32]);

        let s2 = ConvolutionParams::new(0, 0, 2, 2, 1, 1).unwrap();
        let y = s2.forward_output_shape(&t(1, 3, 7, 7), &t(8, 3, 3, 3)).unwrap();
        assert_eq!(y.lengths(), [1, 8, 3, 3]);
    }

    #[test]
    fn dilation_widens_the_receptive_field() {
        let p = ConvolutionParams::new(0, 0, 1, 1, 2, 2).unwrap();
        let y = p.forward_output_shape(&t(1, 4, 10, 10), &t(4, 4, 3, 3)).unwrap();
        assert_eq!((y.h, y.w), (6, 6));
    }

    #[test]
    fn same_and_valid_padding_policies() {
        let same = ConvolutionParams::with_modes(ConvolutionMode::Standard, PaddingMode::Same, 0, 0, 2, 2, 1, 1).unwrap();
        let y = same.forward_output_shape(&t(1, 3, 15, 16), &t(4, 3, 3, 3)).unwrap();
        assert_eq!((y.h, y.w), (8, 8));

        let valid = ConvolutionParams::with_modes(ConvolutionMode::Standard, PaddingMode::Valid, 0, 0, 2, 2, 1, 1).unwrap();
        let y = valid.forward_output_shape(&t(1, 3, 15, 16), &t(4, 3, 3, 3)).unwrap();
        assert_eq!((y.h, y.w), (7, 7));

        // Dilated "same" falls through to the general formula.
        let dilated = ConvolutionParams::with_modes(ConvolutionMode::Standard, PaddingMode::Same, 1, 1, 1, 1, 2, 2).unwrap();
        let y = dilated.forward_output_shape(&t(1, 3, 10, 10), &t(4, 3, 3, 3)).unwrap();
        assert_eq!((y.h, y.w), (8, 8));
    }

    #[test]
    fn transposed_forward_upsamples() {
        let p = ConvolutionParams::with_modes(ConvolutionMode::Transposed, PaddingMode::Default, 1, 1, 2, 2, 1, 1).unwrap();
        // Transposed: input channels match filter K, output channels are filter C.
        let y = p.forward_output_shape(&t(1, 16, 8, 8), &t(16, 4, 3, 3)).unwrap();
        assert_eq!(y.lengths(), [1, 4, 15, 15]);
        assert!(p.forward_output_shape(&t(1, 4, 8, 8), &t(16, 4, 3, 3)).is_err());
    }

    #[test]
    fn grouped_channel_rule() {
        let p = ConvolutionParams::with_modes(ConvolutionMode::Grouped, PaddingMode::Default, 1, 1, 1, 1, 1, 1)
            .unwrap()
            .with_group_count(2)
            .unwrap();
        let y = p.forward_output_shape(&t(1, 8, 5, 5), &t(16, 4, 3, 3)).unwrap();
        assert_eq!(y.c, 16);
        let err = p.forward_output_shape(&t(1, 8, 5, 5), &t(16, 3, 3, 3)).unwrap_err();
        assert!(matches!(err, ConvError::ChannelMismatch { .. }));
    }

    #[test]
    fn depthwise_channel_rule() {
        let p = ConvolutionParams::with_modes(ConvolutionMode::Depthwise, PaddingMode::Default, 1, 1, 1, 1, 1, 1).unwrap();
        assert!(p.forward_output_shape(&t(1, 8, 5, 5), &t(16, 1, 3, 3)).is_ok());
        assert!(p.forward_output_shape(&t(1, 8, 5, 5), &t(12, 1, 3, 3)).is_err());
        assert!(p.forward_output_shape(&t(1, 8, 5, 5), &t(16, 2, 3, 3)).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let p = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
        let x = t(1, 3, 8, 8);
        let w = TensorShape::new(DataType::Half, 4, 3, 3, 3);
        assert!(matches!(p.forward_output_shape(&x, &w), Err(ConvError::ShapeMismatch(_))));
    }

    #[test]
    fn output_is_clamped_to_one() {
        let p = ConvolutionParams::new(0, 0, 1, 1, 1, 1).unwrap();
        let y = p.forward_output_shape(&t(1, 3, 2, 2), &t(4, 3, 5, 5)).unwrap();
        assert_eq!((y.h, y.w), (1, 1));
    }

    #[test]
    fn backward_data_inverts_forward() {
        let p = ConvolutionParams::new(1, 1, 2, 2, 1, 1).unwrap();
        let x = t(2, 8, 9, 9);
        let w = t(16, 8, 3, 3);
        let y = p.forward_output_shape(&x, &w).unwrap();
        let dx = p.backward_data_shape(&y, &w).unwrap();
        assert_eq!(dx.lengths(), x.lengths());
        assert!(p.backward_data_shape(&t(2, 4, 5, 5), &w).is_err());
    }

    #[test]
    fn backward_weights_round_trip() {
        for (pad, stride, size, filter) in [(0, 1, 12, 3), (1, 1, 17, 5), (1, 2, 9, 3), (2, 1, 7, 5)] {
            let p = ConvolutionParams::new(pad, pad, stride, stride, 1, 1).unwrap();
            let x = t(1, 6, size, size);
            let w = t(10, 6, filter, filter);
            let y = p.forward_output_shape(&x, &w).unwrap();
            let dw = p.backward_weights_shape(&x, &y).unwrap();
            assert_eq!(dw.lengths(), w.lengths(), "pad={} stride={} size={}", pad, stride, size);
        }
    }

    #[test]
    fn backward_weights_overshoots_by_stride_remainder() {
        let p = ConvolutionParams::new(0, 0, 2, 2, 1, 1).unwrap();
        let x = t(1, 2, 8, 8);
        let w = t(2, 2, 3, 3);
        let y = p.forward_output_shape(&x, &w).unwrap();
        let dw = p.backward_weights_shape(&x, &y).unwrap();
        // (8 - 3) % 2 == 1: the derived filter is one wider than the real one.
        assert_eq!((dw.h, dw.w), (4, 4));
    }

    #[test]
    fn inconsistent_backward_shapes_error_instead_of_wrapping() {
        let p = ConvolutionParams::new(0, 0, 4, 4, 1, 1).unwrap();
        let err = p.backward_weights_shape(&t(1, 2, 4, 4), &t(1, 2, 8, 8)).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch(_)));
    }
}
