//! Border extension of planar tensors.
//!
//! [`pad_tensor`] is the adapter the pipeline calls: it hands the plan's
//! [`Padding`] to a [`BorderFill`] capability and checks the result has the
//! expected shape. [`FoldingBorderFill`] is the built-in capability.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::planner::Padding;
use crate::tensor::TensorBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Repeat the edge pixel.
    Replicate,
    /// Reflect about the edge pixel without repeating it.
    Mirror,
}

impl fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicate => write!(f, "replicate"),
            Self::Mirror => write!(f, "mirror"),
        }
    }
}

impl FromStr for PaddingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "replicate" | "edge" => Ok(Self::Replicate),
            "mirror" | "reflect" => Ok(Self::Mirror),
            other => bail!("unknown padding mode '{other}' (expected replicate or mirror)"),
        }
    }
}

/// Capability that extends a tensor's borders.
pub trait BorderFill: Send + Sync {
    fn extend(&self, tensor: &TensorBuffer, pad: Padding, mode: PaddingMode) -> Result<TensorBuffer>;
}

/// Index-folding border fill: every destination pixel reads the source pixel its
/// coordinate folds onto, so any margin width works, including margins larger
/// than the image.
#[derive(Debug, Clone, Copy, Default)]
pub struct FoldingBorderFill;

impl BorderFill for FoldingBorderFill {
    fn extend(&self, tensor: &TensorBuffer, pad: Padding, mode: PaddingMode) -> Result<TensorBuffer> {
        let (c, h, w) = tensor.shape();
        if h == 0 || w == 0 {
            bail!("cannot pad an empty {h}x{w} tensor");
        }
        let new_h = h + pad.top + pad.bottom;
        let new_w = w + pad.left + pad.right;

        let rows: Vec<usize> = (0..new_h)
            .map(|y| fold_index(y as isize - pad.top as isize, h, mode))
            .collect();
        let cols: Vec<usize> = (0..new_w)
            .map(|x| fold_index(x as isize - pad.left as isize, w, mode))
            .collect();

        let src = tensor.view();
        let padded = Array3::from_shape_fn((c, new_h, new_w), |(ch, y, x)| {
            src[[ch, rows[y], cols[x]]]
        });
        Ok(TensorBuffer::from_array(padded))
    }
}

/// Maps a possibly out-of-range coordinate onto `[0, len)`.
fn fold_index(i: isize, len: usize, mode: PaddingMode) -> usize {
    let last = len as isize - 1;
    match mode {
        PaddingMode::Replicate => i.clamp(0, last) as usize,
        PaddingMode::Mirror => {
            if last == 0 {
                return 0;
            }
            let period = 2 * last;
            let m = i.rem_euclid(period);
            (if m > last { period - m } else { m }) as usize
        }
    }
}

/// Pads `tensor` through `fill` and validates the output shape.
pub fn pad_tensor(
    fill: &dyn BorderFill,
    tensor: &TensorBuffer,
    pad: Padding,
    mode: PaddingMode,
) -> Result<TensorBuffer> {
    let (c, h, w) = tensor.shape();
    if pad == Padding::default() {
        return Ok(tensor.clone());
    }

    let padded = fill.extend(tensor, pad, mode)?;
    let expected = (c, h + pad.top + pad.bottom, w + pad.left + pad.right);
    if padded.shape() != expected {
        bail!(
            "border fill returned shape {:?}, expected {:?} for padding {:?}",
            padded.shape(),
            expected,
            pad
        );
    }
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[f32]) -> TensorBuffer {
        TensorBuffer::from_vec(1, 1, values.len(), values.to_vec()).unwrap()
    }

    fn first_row(t: &TensorBuffer) -> Vec<f32> {
        t.as_slice().unwrap().to_vec()
    }

    fn horizontal(left: usize, right: usize) -> Padding {
        Padding {
            left,
            right,
            top: 0,
            bottom: 0,
        }
    }

    #[test]
    fn test_replicate_repeats_edges() {
        let t = row(&[1.0, 2.0, 3.0]);
        let padded = pad_tensor(&FoldingBorderFill, &t, horizontal(2, 3), PaddingMode::Replicate)
            .unwrap();
        assert_eq!(
            first_row(&padded),
            vec![1.0, 1.0, 1.0, 2.0, 3.0, 3.0, 3.0, 3.0]
        );
    }

    #[test]
    fn test_mirror_reflects_without_repeating_edge() {
        let t = row(&[1.0, 2.0, 3.0, 4.0]);
        let padded =
            pad_tensor(&FoldingBorderFill, &t, horizontal(2, 2), PaddingMode::Mirror).unwrap();
        assert_eq!(
            first_row(&padded),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
    }

    #[test]
    fn test_mirror_margin_wider_than_image_keeps_folding() {
        let t = row(&[1.0, 2.0, 3.0]);
        let padded =
            pad_tensor(&FoldingBorderFill, &t, horizontal(0, 6), PaddingMode::Mirror).unwrap();
        assert_eq!(
            first_row(&padded),
            vec![1.0, 2.0, 3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]
        );
    }

    #[test]
    fn test_mirror_single_pixel_behaves_like_replicate() {
        let t = row(&[7.0]);
        let padded =
            pad_tensor(&FoldingBorderFill, &t, horizontal(2, 1), PaddingMode::Mirror).unwrap();
        assert_eq!(first_row(&padded), vec![7.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn test_vertical_padding_shape_and_values() {
        let t = TensorBuffer::from_vec(2, 2, 1, vec![1.0, 2.0, 10.0, 20.0]).unwrap();
        let pad = Padding {
            left: 0,
            right: 0,
            top: 1,
            bottom: 2,
        };
        let padded = pad_tensor(&FoldingBorderFill, &t, pad, PaddingMode::Replicate).unwrap();
        assert_eq!(padded.shape(), (2, 5, 1));
        assert_eq!(padded.as_slice().unwrap(), &[1.0, 1.0, 2.0, 2.0, 2.0, 10.0, 10.0, 20.0, 20.0, 20.0]);
    }

    struct ShrinkingFill;

    impl BorderFill for ShrinkingFill {
        fn extend(&self, tensor: &TensorBuffer, _: Padding, _: PaddingMode) -> Result<TensorBuffer> {
            Ok(tensor.clone())
        }
    }

    #[test]
    fn test_adapter_rejects_wrong_output_shape() {
        let t = row(&[1.0, 2.0]);
        let err = pad_tensor(&ShrinkingFill, &t, horizontal(1, 1), PaddingMode::Mirror).unwrap_err();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("reflect".parse::<PaddingMode>().unwrap(), PaddingMode::Mirror);
        assert_eq!("Replicate".parse::<PaddingMode>().unwrap(), PaddingMode::Replicate);
        assert!("zero".parse::<PaddingMode>().is_err());
    }
}
